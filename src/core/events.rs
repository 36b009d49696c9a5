//! Threshold alarms on storage fill levels.
//!
//! Rules are path-like strings:
//!
//! ```text
//! client/[subjectId]/session/[publicSessionId]/queue/callback/event/threshold.90%
//! topic/[topicId]/queue/history/event/threshold.90%
//! client/[subjectId]/queue/subject/event/threshold.66
//! ```
//!
//! A subject or session segment may be `*`. Every watched storage gets its own
//! copy of the best matching rule, so the one-shot state is per storage.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::core::error::{Result, StoreError};
use crate::core::storage::{Storage, StorageSizeListener};
use crate::core::storage_id::{self, StorageId};
use crate::core::timestamp;

pub const WILDCARD: &str = "*";

const THRESHOLD_MARKER: &str = "/event/threshold.";
const QUEUE_MARKER: &str = "/queue/";

fn compose_key(kind: &str, id1: &str, id2: &str) -> String {
    format!("{kind}/{id1}/{id2}")
}

/// One threshold rule, or a storage's private copy of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHelper {
    event_type: String,
    kind: String,
    id1: String,
    id2: String,
    value: i64,
    percent: bool,
    already_alarmed: bool,
    key: String,
}

impl EventHelper {
    /// `raw_value` is a non-negative integer, optionally suffixed with `%`.
    pub fn new(event_type: &str, kind: &str, id1: &str, id2: &str, raw_value: &str) -> Result<Self> {
        let (number, percent) = match raw_value.strip_suffix('%') {
            Some(n) => (n, true),
            None => (raw_value, false),
        };
        let value: i64 = number.trim().parse().map_err(|e| {
            StoreError::Configuration(format!("threshold '{raw_value}' of '{event_type}' is not a number: {e}"))
        })?;
        if value < 0 {
            return Err(StoreError::Configuration(format!(
                "threshold '{raw_value}' of '{event_type}' is negative"
            )));
        }
        Ok(Self {
            event_type: event_type.to_string(),
            kind: kind.to_string(),
            id1: id1.to_string(),
            id2: id2.to_string(),
            value,
            percent,
            already_alarmed: false,
            key: compose_key(kind, id1, id2),
        })
    }

    /// Parses a rule path into its coordinates and threshold.
    pub fn parse(rule: &str) -> Result<Self> {
        let bad = |why: &str| StoreError::Configuration(format!("event '{rule}' {why}"));

        let at = rule
            .rfind(THRESHOLD_MARKER)
            .ok_or_else(|| bad("has no '/event/threshold.' part"))?;
        let raw_value = &rule[at + THRESHOLD_MARKER.len()..];
        let head = &rule[..at];

        let at = head
            .rfind(QUEUE_MARKER)
            .ok_or_else(|| bad("has no '/queue/' part"))?;
        let kind = &head[at + QUEUE_MARKER.len()..];
        let owner = &head[..at];
        let segments: Vec<&str> = owner.split('/').collect();

        let (id1, id2) = match kind {
            storage_id::HISTORY | storage_id::SUBJECT => {
                let id = segments.last().copied().unwrap_or_default();
                (id, "")
            }
            storage_id::CALLBACK => {
                // client/<subject>/session/<session>
                if segments.len() < 3 {
                    return Err(bad("needs 'client/<subject>/session/<session>'"));
                }
                (segments[segments.len() - 3], segments[segments.len() - 1])
            }
            _ => return Err(bad("is not supported")),
        };
        if id1.is_empty() {
            return Err(bad("has an empty id"));
        }
        Self::new(rule, kind, id1, id2, raw_value)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id1(&self) -> &str {
        &self.id1
    }

    pub fn id2(&self) -> &str {
        &self.id2
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn is_percent(&self) -> bool {
        self.percent
    }

    /// Copy for one storage: a percentage resolves against the storage's
    /// capacity and the result never exceeds that capacity.
    pub fn get_copy(&self, storage: Option<&dyn Storage>) -> Self {
        let mut copy = self.clone();
        copy.already_alarmed = false;
        let max = storage.map_or(1, |s| s.max_entries());
        let max = if max < 0 { 1 } else { max };
        if copy.percent {
            copy.value = (0.01 * copy.value as f64 * max as f64) as i64;
            copy.percent = false;
        }
        if copy.value > max {
            let id = storage.map(|s| s.storage_id().to_string()).unwrap_or_default();
            warn!(
                storage_id = %id,
                threshold = copy.value,
                max_entries = max,
                "threshold exceeds storage capacity, clamping to capacity"
            );
            copy.value = max;
        }
        copy
    }

    /// Fires once when `num_entries` reaches the threshold and re-arms only
    /// after it drops below again.
    pub fn shall_trigger(&mut self, num_entries: i64) -> bool {
        if num_entries < self.value {
            self.already_alarmed = false;
            return false;
        }
        if self.already_alarmed {
            return false;
        }
        self.already_alarmed = true;
        true
    }
}

/// Receiver of threshold alarms.
pub trait EventDispatcher: Send + Sync {
    fn dispatch_event(&self, summary: &str, description: &str, event_type: &str);
}

/// Writes alarms to the log.
#[derive(Debug, Default)]
pub struct LogDispatcher;

impl EventDispatcher for LogDispatcher {
    fn dispatch_event(&self, summary: &str, description: &str, event_type: &str) {
        warn!(summary, event_type, "{description}");
    }
}

#[derive(Default)]
struct Binding {
    /// `Some` until `register_finished`; storages seen before that wait here.
    pending: Option<Vec<Weak<dyn Storage>>>,
    watched: HashMap<StorageId, EventHelper>,
}

/// Owns the configured rules and watches every registered storage that
/// matches one.
pub struct StorageEventHandler {
    rules: RwLock<HashMap<String, EventHelper>>,
    dispatcher: Arc<dyn EventDispatcher>,
    binding: Mutex<Binding>,
    me: Weak<StorageEventHandler>,
}

impl fmt::Debug for StorageEventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binding = self.binding.lock();
        f.debug_struct("StorageEventHandler")
            .field("rules", &self.rules.read().len())
            .field("watched", &binding.watched.len())
            .field("finished", &binding.pending.is_none())
            .finish()
    }
}

impl StorageEventHandler {
    pub fn new(dispatcher: Arc<dyn EventDispatcher>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            rules: RwLock::new(HashMap::new()),
            dispatcher,
            binding: Mutex::new(Binding {
                pending: Some(Vec::new()),
                watched: HashMap::new(),
            }),
            me: me.clone(),
        })
    }

    /// Parses and stores a rule. A later rule for the same coordinates
    /// replaces the earlier one.
    pub fn register_event(&self, rule: &str) -> Result<()> {
        let helper = EventHelper::parse(rule)?;
        debug!(key = helper.key(), value = helper.value(), percent = helper.is_percent(), "threshold rule registered");
        self.rules.write().insert(helper.key().to_string(), helper);
        Ok(())
    }

    pub fn register_events<'a>(&self, rules: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for rule in rules {
            self.register_event(rule)?;
        }
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Best match: exact, then `(id1, *)`, then `(*, id2)`, then `(*, *)`.
    pub fn matching_rule(&self, kind: &str, id1: &str, id2: &str) -> Option<EventHelper> {
        let rules = self.rules.read();
        [
            compose_key(kind, id1, id2),
            compose_key(kind, id1, WILDCARD),
            compose_key(kind, WILDCARD, id2),
            compose_key(kind, WILDCARD, WILDCARD),
        ]
        .iter()
        .find_map(|key| rules.get(key).cloned())
    }

    /// Starts watching `storage` if a rule matches it. Before
    /// [`register_finished`](Self::register_finished) the storage is parked.
    pub fn register_storage(&self, storage: &Arc<dyn Storage>) {
        {
            let mut binding = self.binding.lock();
            if let Some(pending) = binding.pending.as_mut() {
                pending.push(Arc::downgrade(storage));
                return;
            }
        }
        self.bind(storage);
    }

    fn bind(&self, storage: &Arc<dyn Storage>) {
        let id = storage.storage_id();
        let Some((kind, id1, id2)) = id.event_coordinates() else {
            return;
        };
        let Some(rule) = self.matching_rule(&kind, &id1, &id2) else {
            return;
        };
        let copy = rule.get_copy(Some(storage.as_ref()));
        {
            let mut binding = self.binding.lock();
            if binding.watched.contains_key(id) {
                return;
            }
            debug!(storage_id = %id, rule = rule.key(), threshold = copy.value(), "storage watched");
            binding.watched.insert(id.clone(), copy);
        }
        if let Some(me) = self.me.upgrade() {
            storage.add_storage_size_listener(me);
        }
    }

    /// Binds every parked storage; later registrations bind immediately.
    pub fn register_finished(&self) {
        let parked = self.binding.lock().pending.take().unwrap_or_default();
        let live: Vec<Arc<dyn Storage>> = parked.iter().filter_map(Weak::upgrade).collect();
        info!(rules = self.rule_count(), storages = live.len(), "threshold registration finished");
        for storage in &live {
            self.bind(storage);
        }
    }

    pub fn unregister_storage(&self, storage: &dyn Storage) {
        self.binding.lock().watched.remove(storage.storage_id());
        if let Some(me) = self.me.upgrade() {
            let listener: Arc<dyn StorageSizeListener> = me;
            storage.remove_storage_size_listener(Some(&listener));
        }
    }

    pub fn is_watched(&self, storage_id: &StorageId) -> bool {
        self.binding.lock().watched.contains_key(storage_id)
    }

    /// Resolved threshold of a watched storage.
    pub fn threshold_of(&self, storage_id: &StorageId) -> Option<i64> {
        self.binding
            .lock()
            .watched
            .get(storage_id)
            .map(EventHelper::value)
    }
}

impl StorageSizeListener for StorageEventHandler {
    fn changed(&self, storage: &dyn Storage, num_entries: i64, _num_bytes: i64, is_shutdown: bool) {
        let event_type = {
            let mut binding = self.binding.lock();
            if is_shutdown {
                binding.watched.remove(storage.storage_id());
                return;
            }
            let Some(helper) = binding.watched.get_mut(storage.storage_id()) else {
                return;
            };
            if !helper.shall_trigger(num_entries) {
                return;
            }
            helper.event_type().to_string()
        };
        let summary = format!("[{} {}]", timestamp::now_millis(), module_path!());
        let description = format!(
            "The queue '{}' has reached its threshold: '{}' of max '{}' (message sent only once)",
            storage.storage_id(),
            num_entries,
            storage.max_entries()
        );
        self.dispatcher.dispatch_event(&summary, &description, &event_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entry::{DummyEntry, Entry};
    use crate::core::priority::Priority;
    use crate::core::storage::{QueueProperty, RamQueue};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl EventDispatcher for Recorder {
        fn dispatch_event(&self, _summary: &str, _description: &str, event_type: &str) {
            self.0.lock().push(event_type.to_string());
        }
    }

    #[test]
    fn parses_callback_rule() {
        let h = EventHelper::parse("client/joe/session/1/queue/callback/event/threshold.90%").unwrap();
        assert_eq!((h.kind(), h.id1(), h.id2()), ("callback", "joe", "1"));
        assert_eq!(h.value(), 90);
        assert!(h.is_percent());
        assert_eq!(h.key(), "callback/joe/1");
    }

    #[test]
    fn parses_history_and_subject_rules() {
        let h = EventHelper::parse("topic/hello/queue/history/event/threshold.5").unwrap();
        assert_eq!((h.kind(), h.id1(), h.id2(), h.value()), ("history", "hello", "", 5));
        let s = EventHelper::parse("client/joe/queue/subject/event/threshold.66").unwrap();
        assert_eq!((s.kind(), s.id1()), ("subject", "joe"));
    }

    #[test]
    fn rejects_bad_rules() {
        for rule in [
            "client/joe/queue/unknown/event/threshold.1",
            "topic/hello/queue/history/event/threshold.abc",
            "topic/hello/queue/history/event/threshold.-3",
            "topic/hello/history",
        ] {
            let err = EventHelper::parse(rule).unwrap_err();
            assert!(err.is_configuration(), "{rule}: {err}");
        }
    }

    #[test]
    fn percent_resolves_and_clamps() {
        let q = RamQueue::new(
            StorageId::parse("history:/node/a/topic/hello").unwrap(),
            QueueProperty::unlimited().with_max_entries(200),
        );
        let pct = EventHelper::new("e", "history", "hello", "", "50%").unwrap();
        assert_eq!(pct.get_copy(Some(&q)).value(), 100);
        let abs = EventHelper::new("e", "history", "hello", "", "500").unwrap();
        assert_eq!(abs.get_copy(Some(&q)).value(), 200);
    }

    #[test]
    fn hysteresis_fires_once_per_crossing() {
        let mut h = EventHelper::new("e", "history", "t", "", "5").unwrap();
        let fired: Vec<bool> = [4, 5, 6, 10, 4, 5].iter().map(|n| h.shall_trigger(*n)).collect();
        assert_eq!(fired, vec![false, true, false, false, false, true]);
    }

    #[test]
    fn best_match_prefers_exact_then_wildcards() {
        let handler = StorageEventHandler::new(Arc::new(LogDispatcher));
        handler
            .register_events([
                "client/*/session/*/queue/callback/event/threshold.1",
                "client/*/session/7/queue/callback/event/threshold.2",
                "client/joe/session/*/queue/callback/event/threshold.3",
                "client/joe/session/7/queue/callback/event/threshold.4",
            ])
            .unwrap();
        let value = |id1, id2| handler.matching_rule("callback", id1, id2).map(|r| r.value());
        assert_eq!(value("joe", "7"), Some(4));
        assert_eq!(value("joe", "8"), Some(3));
        assert_eq!(value("ann", "7"), Some(2));
        assert_eq!(value("ann", "8"), Some(1));
    }

    #[test]
    fn parked_storage_binds_on_finish() {
        let recorder = Arc::new(Recorder::default());
        let handler = StorageEventHandler::new(recorder.clone());
        handler
            .register_event("topic/hello/queue/history/event/threshold.2")
            .unwrap();
        let q: Arc<dyn Storage> = Arc::new(RamQueue::new(
            StorageId::parse("history:/node/a/topic/hello").unwrap(),
            QueueProperty::unlimited().with_max_entries(10),
        ));
        handler.register_storage(&q);
        assert!(!handler.is_watched(q.storage_id()));
        handler.register_finished();
        assert_eq!(handler.threshold_of(q.storage_id()), Some(2));

        for id in 1..=3 {
            let e: Entry = DummyEntry::with_id(Priority::NORM, id, false, 1).into();
            q.put(e, false).unwrap();
        }
        assert_eq!(recorder.0.lock().len(), 1);
    }
}
