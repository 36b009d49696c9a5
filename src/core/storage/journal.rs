//! Durable storage backed by an append-only journal file.
//!
//! File layout:
//! - header: 8-byte magic `BLIPSTOR`, u32 LE version, u32 reserved
//! - records: u8 kind, u32 LE payload length, u32 LE crc32(kind, length,
//!   payload), payload
//!
//! A `Put` payload is a bincode [`JournalRow`]; `Remove` carries the removed
//! unique ids; `Clear` is empty. Replaying the file rebuilds the live set.
//! A damaged record is skipped and counted when an intact record follows it;
//! replay resumes there. Damage with nothing intact behind it is a torn tail
//! and is truncated. An entry that no longer decodes is skipped and counted.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::entry::{Entry, OrderKey};
use crate::core::error::{Result, StoreError};
use crate::core::factory::{BlobRow, EntryFactory};
use crate::core::priority::Priority;
use crate::core::storage::queue::{RecoveredSlot, SortedQueue, Tier};
use crate::core::storage::QueueProperty;
use crate::core::storage_id::StorageId;

const MAGIC: &[u8; 8] = b"BLIPSTOR";
const VERSION: u32 = 2;
const HEADER_LEN: u64 = 16;
const RECORD_HEADER_LEN: u64 = 9;

const KIND_PUT: u8 = 1;
const KIND_REMOVE: u8 = 2;
const KIND_CLEAR: u8 = 3;

/// One persisted entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRow {
    pub priority: i32,
    pub unique_id: i64,
    pub embedded_type: String,
    pub persistent: bool,
    pub size_in_bytes: i64,
    pub blob: Vec<u8>,
}

impl JournalRow {
    fn as_blob_row(&self) -> BlobRow<'_> {
        BlobRow {
            priority: self.priority,
            unique_id: self.unique_id,
            embedded_type: &self.embedded_type,
            persistent: self.persistent,
            size_in_bytes: self.size_in_bytes,
            blob: &self.blob,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JournalOptions {
    /// fsync after this many appends; `None` leaves flushing to the OS.
    pub fsync_every_n: Option<usize>,
    /// Compaction is considered only for files larger than this.
    pub compact_min_bytes: u64,
    /// Drop rows of non-persistent entries while replaying.
    pub discard_transient: bool,
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            fsync_every_n: None,
            compact_min_bytes: 4 * 1024 * 1024,
            discard_transient: false,
        }
    }
}

/// Outcome of replaying a journal at open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub corrupted: usize,
    pub discarded_transient: usize,
    pub truncated_bytes: u64,
}

#[derive(Debug, Default)]
pub struct JournalStats {
    pub appends: AtomicU64,
    pub bytes_written: AtomicU64,
    pub fsyncs: AtomicU64,
    pub compactions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalStatsSnapshot {
    pub appends: u64,
    pub bytes_written: u64,
    pub fsyncs: u64,
    pub compactions: u64,
}

impl JournalStats {
    pub fn snapshot(&self) -> JournalStatsSnapshot {
        JournalStatsSnapshot {
            appends: self.appends.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            fsyncs: self.fsyncs.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Location {
    offset: u64,
    len: u32,
}

/// Handle of a journaled entry; the tier resolves it to a file location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalSlot {
    unique_id: i64,
}

pub fn journal_path(dir: &Path, storage_id: &StorageId) -> PathBuf {
    dir.join(format!("{}.journal", storage_id.file_stem()))
}

#[derive(Debug)]
pub struct JournalTier {
    path: PathBuf,
    storage_id: StorageId,
    factory: Arc<EntryFactory>,
    writer: File,
    reader: Mutex<File>,
    live: HashMap<i64, Location>,
    file_len: u64,
    live_bytes: u64,
    options: JournalOptions,
    unsynced: usize,
    healthy: bool,
    report: RecoveryReport,
    stats: JournalStats,
}

fn write_header(file: &mut File) -> io::Result<()> {
    let mut header = Vec::with_capacity(HEADER_LEN as usize);
    header.extend_from_slice(MAGIC);
    header.extend_from_slice(&VERSION.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes());
    file.write_all(&header)
}

fn record_checksum(kind: u8, len: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind]);
    hasher.update(&len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn encode_record(kind: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN as usize + payload.len());
    buf.push(kind);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&record_checksum(kind, len, payload).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

enum Parsed<'a> {
    Record { kind: u8, payload: &'a [u8] },
    Eof,
    /// The header or the payload runs past the end of the file.
    Incomplete,
    /// Checksum mismatch; `len` comes from an unverified header.
    Invalid { len: usize },
}

fn parse_record(buf: &[u8], at: usize) -> Parsed<'_> {
    let rest = buf.get(at..).unwrap_or_default();
    if rest.is_empty() {
        return Parsed::Eof;
    }
    let header_len = RECORD_HEADER_LEN as usize;
    if rest.len() < header_len {
        return Parsed::Incomplete;
    }
    let kind = rest[0];
    let len = u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]);
    let crc = u32::from_le_bytes([rest[5], rest[6], rest[7], rest[8]]);
    let body = &rest[header_len..];
    if len as usize > body.len() {
        return Parsed::Incomplete;
    }
    let payload = &body[..len as usize];
    if record_checksum(kind, len, payload) != crc {
        return Parsed::Invalid { len: len as usize };
    }
    Parsed::Record { kind, payload }
}

fn is_valid_record(buf: &[u8], at: usize) -> bool {
    matches!(
        parse_record(buf, at),
        Parsed::Record { kind: KIND_PUT | KIND_REMOVE | KIND_CLEAR, .. }
    )
}

/// Where replay continues after a damaged record at `at`, or `None` if no
/// intact record follows it.
///
/// The skip length from the damaged header is tried first; otherwise the
/// file is scanned byte by byte for the next intact record.
fn resume_after(buf: &[u8], at: usize, claimed_len: Option<usize>) -> Option<usize> {
    if let Some(len) = claimed_len {
        let next = at + RECORD_HEADER_LEN as usize + len;
        if next == buf.len() || is_valid_record(buf, next) {
            return Some(next);
        }
    }
    (at + 1..buf.len()).find(|&candidate| is_valid_record(buf, candidate))
}

impl JournalTier {
    /// Opens or creates the journal and replays it.
    pub fn open(
        path: impl AsRef<Path>,
        storage_id: StorageId,
        factory: Arc<EntryFactory>,
        options: JournalOptions,
    ) -> Result<(Self, Vec<RecoveredSlot<JournalSlot>>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        if writer.metadata()?.len() == 0 {
            write_header(&mut writer)?;
            writer.sync_all()?;
        }

        let mut tier = Self {
            reader: Mutex::new(File::open(&path)?),
            path,
            storage_id,
            factory,
            writer,
            live: HashMap::new(),
            file_len: 0,
            live_bytes: 0,
            options,
            unsynced: 0,
            healthy: true,
            report: RecoveryReport::default(),
            stats: JournalStats::default(),
        };
        let recovered = tier.replay()?;
        info!(
            storage_id = %tier.storage_id,
            path = %tier.path.display(),
            recovered = tier.report.recovered,
            corrupted = tier.report.corrupted,
            "journal opened"
        );
        Ok((tier, recovered))
    }

    fn replay(&mut self) -> Result<Vec<RecoveredSlot<JournalSlot>>> {
        let bytes = fs::read(&self.path)?;
        let header_len = HEADER_LEN as usize;
        if bytes.len() < header_len {
            return Err(StoreError::Corruption(format!("{}: truncated header", self.path.display())));
        }
        if &bytes[..8] != MAGIC {
            return Err(StoreError::Corruption(format!("{}: bad magic", self.path.display())));
        }
        let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if version != VERSION {
            return Err(StoreError::Corruption(format!(
                "{}: unsupported journal version {version}",
                self.path.display()
            )));
        }

        let mut rows: HashMap<i64, RecoveredSlot<JournalSlot>> = HashMap::new();
        let mut at = header_len;
        let mut transient = Vec::new();
        loop {
            let (kind, payload) = match parse_record(&bytes, at) {
                Parsed::Eof => break,
                Parsed::Record { kind, payload } => (kind, payload),
                damaged => {
                    let claimed_len = match damaged {
                        Parsed::Invalid { len } => Some(len),
                        _ => None,
                    };
                    match resume_after(&bytes, at, claimed_len) {
                        Some(next) => {
                            self.report.corrupted += 1;
                            error!(
                                storage_id = %self.storage_id,
                                offset = at,
                                skipped = next - at,
                                "damaged journal record, skipping"
                            );
                            at = next;
                            continue;
                        }
                        None => {
                            self.report.truncated_bytes = (bytes.len() - at) as u64;
                            warn!(
                                storage_id = %self.storage_id,
                                offset = at,
                                bytes = self.report.truncated_bytes,
                                "truncating torn journal tail"
                            );
                            self.writer.set_len(at as u64)?;
                            break;
                        }
                    }
                }
            };
            let payload_offset = (at + RECORD_HEADER_LEN as usize) as u64;
            at += RECORD_HEADER_LEN as usize + payload.len();
            match kind {
                KIND_PUT => {
                    let location = Location {
                        offset: payload_offset,
                        len: payload.len() as u32,
                    };
                    if let Some(slot) = self.recover_put(payload, location) {
                        if self.options.discard_transient && !slot.persistent {
                            transient.push(slot.key.unique_id);
                        }
                        self.live.insert(slot.key.unique_id, location);
                        rows.insert(slot.key.unique_id, slot);
                    }
                }
                KIND_REMOVE => match bincode::deserialize::<Vec<i64>>(payload) {
                    Ok(ids) => {
                        for id in ids {
                            self.live.remove(&id);
                            rows.remove(&id);
                        }
                    }
                    Err(e) => {
                        self.report.corrupted += 1;
                        error!(storage_id = %self.storage_id, error = %e, "undecodable remove record, skipping");
                    }
                },
                KIND_CLEAR => {
                    self.live.clear();
                    rows.clear();
                }
                other => {
                    self.report.corrupted += 1;
                    error!(storage_id = %self.storage_id, kind = other, "unknown journal record kind, skipping");
                }
            }
        }
        self.file_len = at as u64;
        self.live_bytes = self
            .live
            .values()
            .map(|l| RECORD_HEADER_LEN + l.len as u64)
            .sum();

        transient.retain(|id| rows.contains_key(id));
        if !transient.is_empty() {
            self.report.discarded_transient = transient.len();
            debug!(storage_id = %self.storage_id, count = transient.len(), "discarding swapped transient entries");
            for id in &transient {
                rows.remove(id);
            }
            self.discard_ids(&transient)?;
        }
        self.report.recovered = rows.len();
        Ok(rows.into_values().collect())
    }

    /// Decodes a put record during replay. `None` if the row is unusable.
    fn recover_put(&mut self, payload: &[u8], location: Location) -> Option<RecoveredSlot<JournalSlot>> {
        let row: JournalRow = match bincode::deserialize(payload) {
            Ok(row) => row,
            Err(e) => {
                self.report.corrupted += 1;
                error!(storage_id = %self.storage_id, offset = location.offset, error = %e, "undecodable journal row, skipping");
                return None;
            }
        };
        if let Err(e) = self.factory.deserialize(&row.as_blob_row(), Some(&self.storage_id)) {
            self.report.corrupted += 1;
            error!(
                storage_id = %self.storage_id,
                entry_type = %row.embedded_type,
                priority = row.priority,
                timestamp = row.unique_id,
                error = %e,
                "could not recover entry, skipping"
            );
            return None;
        }
        let priority = match Priority::new(row.priority) {
            Ok(p) => p,
            Err(_) => {
                self.report.corrupted += 1;
                return None;
            }
        };
        Some(RecoveredSlot {
            key: OrderKey::new(priority, row.unique_id),
            size: row.size_in_bytes,
            persistent: row.persistent,
            slot: JournalSlot {
                unique_id: row.unique_id,
            },
        })
    }

    fn append(&mut self, kind: u8, payload: &[u8]) -> Result<Location> {
        let record = encode_record(kind, payload);
        if let Err(e) = self.writer.write_all(&record) {
            self.healthy = false;
            error!(storage_id = %self.storage_id, error = %e, "journal append failed");
            return Err(e.into());
        }
        let location = Location {
            offset: self.file_len + RECORD_HEADER_LEN,
            len: payload.len() as u32,
        };
        self.file_len += record.len() as u64;
        self.stats.appends.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(record.len() as u64, Ordering::Relaxed);

        self.unsynced += 1;
        if let Some(every) = self.options.fsync_every_n {
            if self.unsynced >= every.max(1) {
                self.sync()?;
            }
        }
        self.healthy = true;
        Ok(location)
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.sync_data()?;
        self.unsynced = 0;
        self.stats.fsyncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_row(&self, location: Location) -> Result<JournalRow> {
        let mut reader = self.reader.lock();
        reader.seek(SeekFrom::Start(location.offset))?;
        let mut payload = vec![0u8; location.len as usize];
        reader.read_exact(&mut payload)?;
        Ok(bincode::deserialize(&payload)?)
    }

    fn discard_ids(&mut self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let payload = bincode::serialize(ids)?;
        self.append(KIND_REMOVE, &payload)?;
        for id in ids {
            if let Some(location) = self.live.remove(id) {
                self.live_bytes -= RECORD_HEADER_LEN + location.len as u64;
            }
        }
        self.maybe_compact()
    }

    fn maybe_compact(&mut self) -> Result<()> {
        let used = self.file_len - HEADER_LEN;
        let dead = used.saturating_sub(self.live_bytes);
        if self.file_len >= self.options.compact_min_bytes && dead > self.live_bytes {
            self.compact()?;
        }
        Ok(())
    }

    /// Rewrites the journal with only the live put records.
    pub fn compact(&mut self) -> Result<()> {
        let tmp_path = self.path.with_extension("journal.compact");
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        write_header(&mut tmp)?;

        let mut relocated = HashMap::with_capacity(self.live.len());
        let mut offset = HEADER_LEN;
        {
            let mut reader = self.reader.lock();
            let mut live: Vec<(i64, Location)> = self.live.iter().map(|(k, v)| (*k, *v)).collect();
            live.sort_by_key(|(_, l)| l.offset);
            for (id, location) in live {
                reader.seek(SeekFrom::Start(location.offset))?;
                let mut payload = vec![0u8; location.len as usize];
                reader.read_exact(&mut payload)?;
                let record = encode_record(KIND_PUT, &payload);
                tmp.write_all(&record)?;
                relocated.insert(
                    id,
                    Location {
                        offset: offset + RECORD_HEADER_LEN,
                        len: location.len,
                    },
                );
                offset += record.len() as u64;
            }
        }
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path)?;

        self.writer = OpenOptions::new().read(true).append(true).open(&self.path)?;
        *self.reader.lock() = File::open(&self.path)?;
        let before = self.file_len;
        self.file_len = offset;
        self.live = relocated;
        self.unsynced = 0;
        self.stats.compactions.fetch_add(1, Ordering::Relaxed);
        debug!(storage_id = %self.storage_id, before, after = offset, "journal compacted");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn report(&self) -> RecoveryReport {
        self.report
    }

    pub fn stats(&self) -> JournalStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }
}

impl Tier for JournalTier {
    type Slot = JournalSlot;

    fn is_transient(&self) -> bool {
        false
    }

    fn persistent_counts_known(&self) -> bool {
        self.healthy
    }

    fn store(&mut self, entry: &Entry) -> Result<JournalSlot> {
        let row = JournalRow {
            priority: entry.priority().as_i32(),
            unique_id: entry.unique_id(),
            embedded_type: entry.embedded_type().as_str().to_string(),
            persistent: entry.is_persistent(),
            size_in_bytes: entry.size_in_bytes(),
            blob: self.factory.serialize(entry)?,
        };
        let payload = bincode::serialize(&row)?;
        let location = self.append(KIND_PUT, &payload)?;
        if let Some(previous) = self.live.insert(row.unique_id, location) {
            self.live_bytes -= RECORD_HEADER_LEN + previous.len as u64;
        }
        self.live_bytes += RECORD_HEADER_LEN + location.len as u64;
        Ok(JournalSlot {
            unique_id: row.unique_id,
        })
    }

    fn load(&self, slot: &JournalSlot) -> Result<Entry> {
        let location = self.live.get(&slot.unique_id).copied().ok_or_else(|| {
            StoreError::Corruption(format!(
                "{}: no journal record for unique id {}",
                self.storage_id, slot.unique_id
            ))
        })?;
        let row = self.read_row(location)?;
        self.factory
            .deserialize(&row.as_blob_row(), Some(&self.storage_id))
    }

    fn replace(&mut self, _old: &JournalSlot, entry: &Entry) -> Result<JournalSlot> {
        // A later put of the same id supersedes the earlier one on replay.
        let slot = self.store(entry)?;
        self.maybe_compact()?;
        Ok(slot)
    }

    fn discard(&mut self, slots: &[JournalSlot]) -> Result<()> {
        let ids: Vec<i64> = slots.iter().map(|s| s.unique_id).collect();
        self.discard_ids(&ids)
    }

    fn discard_all(&mut self) -> Result<()> {
        self.writer.set_len(HEADER_LEN)?;
        self.writer.sync_all()?;
        self.file_len = HEADER_LEN;
        self.live.clear();
        self.live_bytes = 0;
        Ok(())
    }

    fn close(&mut self) {
        if let Err(e) = self.sync() {
            warn!(storage_id = %self.storage_id, error = %e, "journal sync on close failed");
        }
    }
}

pub type JournalQueue = SortedQueue<JournalTier>;

impl SortedQueue<JournalTier> {
    /// Opens the journal for `storage_id` under `dir`, restoring its entries.
    pub fn open(
        storage_id: StorageId,
        property: QueueProperty,
        dir: impl AsRef<Path>,
        factory: Arc<EntryFactory>,
        options: JournalOptions,
    ) -> Result<Self> {
        let path = journal_path(dir.as_ref(), &storage_id);
        let (tier, recovered) = JournalTier::open(path, storage_id.clone(), factory, options)?;
        Ok(Self::with_tier(storage_id, property, tier, recovered))
    }

    pub fn recovery_report(&self) -> RecoveryReport {
        self.with_tier_ref(JournalTier::report)
    }

    pub fn journal_stats(&self) -> JournalStatsSnapshot {
        self.with_tier_ref(JournalTier::stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entry::DummyEntry;
    use crate::core::storage::Storage;

    fn storage_id() -> StorageId {
        StorageId::parse("subject:/node/test/client/joe").unwrap()
    }

    fn open(dir: &Path) -> JournalQueue {
        JournalQueue::open(
            storage_id(),
            QueueProperty::unlimited(),
            dir,
            Arc::new(EntryFactory::new()),
            JournalOptions::default(),
        )
        .unwrap()
    }

    fn dummy(id: i64) -> Entry {
        DummyEntry::with_id(Priority::NORM, id, true, 64)
            .with_content(format!("body-{id}"))
            .into()
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let q = open(dir.path());
            q.put_all((1..=3).map(dummy).collect(), false).unwrap();
            q.take().unwrap();
            q.shutdown();
        }
        let q = open(dir.path());
        assert_eq!(q.entry_references().unwrap(), vec![2, 3]);
        let Some(Entry::Dummy(d)) = q.peek().unwrap() else {
            panic!("expected dummy entry");
        };
        assert_eq!(d.content().as_ref(), b"body-2");
        assert_eq!(q.recovery_report().recovered, 2);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(dir.path(), &storage_id());
        {
            let q = open(dir.path());
            q.put_all((1..=2).map(dummy).collect(), false).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let q = open(dir.path());
        assert_eq!(q.entry_references().unwrap(), vec![1]);
        assert!(q.recovery_report().truncated_bytes > 0);
        q.put(dummy(5), false).unwrap();
        drop(q);
        assert_eq!(open(dir.path()).entry_references().unwrap(), vec![1, 5]);
    }

    #[test]
    fn clear_truncates_file() {
        let dir = tempfile::tempdir().unwrap();
        let q = open(dir.path());
        q.put_all((1..=4).map(dummy).collect(), false).unwrap();
        assert_eq!(q.clear().unwrap(), 4);
        assert_eq!(q.with_tier_ref(JournalTier::file_len), HEADER_LEN);
        drop(q);
        assert!(open(dir.path()).entry_references().unwrap().is_empty());
    }

    #[test]
    fn compaction_keeps_live_entries() {
        let dir = tempfile::tempdir().unwrap();
        let q = JournalQueue::open(
            storage_id(),
            QueueProperty::unlimited(),
            dir.path(),
            Arc::new(EntryFactory::new()),
            JournalOptions {
                compact_min_bytes: 0,
                ..JournalOptions::default()
            },
        )
        .unwrap();
        q.put_all((1..=10).map(dummy).collect(), false).unwrap();
        q.take_n(8, -1).unwrap();
        assert!(q.journal_stats().compactions > 0);
        assert_eq!(q.entry_references().unwrap(), vec![9, 10]);
        drop(q);
        assert_eq!(open(dir.path()).entry_references().unwrap(), vec![9, 10]);
    }
}
