//! Inspection tool for BlipStore journals.
//!
//! Opens the storages of a node the same way the library does and prints
//! their contents, counters or recovery report.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use blipstore::config::StoreConfig;
use blipstore::core::factory::EntryFactory;
use blipstore::core::storage::{JournalOptions, JournalQueue, Storage};
use blipstore::logging::init_logging;
use blipstore::{StorageId, StoreContext};

/// Command-line interface for BlipStore.
#[derive(Debug, Parser)]
#[command(name = "blipstore", version, about = "Inspect BlipStore queues and journals")]
pub struct Cli {
    /// Path to blipstore.toml (falls back to BLIPSTORE_CONFIG)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Overrides journal.directory from the config
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the entries of a storage in queue order
    Dump {
        /// Storage id, e.g. callback:/node/a/client/joe/1
        storage_id: String,
        /// Maximum number of entries, -1 for all
        #[arg(short, long, default_value_t = 100)]
        limit: i64,
    },

    /// Print entry and byte counters of a storage and of the payload store
    Stats {
        storage_id: String,
    },

    /// Replay a journal and report corrupted or truncated records.
    /// A torn tail is truncated as part of the replay.
    Verify {
        storage_id: String,
    },
}

fn main() {
    init_logging();

    let cli = Cli::parse();
    let mut config = match StoreConfig::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[FATAL] Failed to load config: {e}");
            process::exit(1);
        }
    };
    if let Some(dir) = cli.dir {
        config.journal.directory = dir;
    }

    match run(config, cli.command) {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("[FATAL] {e:#}");
            process::exit(1);
        }
    }
}

fn run(config: StoreConfig, command: Command) -> anyhow::Result<i32> {
    match command {
        Command::Dump { storage_id, limit } => {
            let id = StorageId::parse(&storage_id)?;
            let ctx = StoreContext::open(config)?;
            let storage = ctx.open_storage(&id)?;
            for entry in storage.peek_n(limit, -1)? {
                let payload = entry
                    .meat()
                    .map(|m| format!("{} ({} bytes)", m.key_oid(), m.msg_unit().content.len()))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>20} prio={} type={} persistent={} size={} payload={}",
                    entry.unique_id(),
                    entry.priority().as_i32(),
                    entry.embedded_type().as_str(),
                    entry.is_persistent(),
                    entry.size_in_bytes(),
                    payload
                );
            }
            ctx.shutdown();
            Ok(0)
        }
        Command::Stats { storage_id } => {
            let id = StorageId::parse(&storage_id)?;
            let ctx = StoreContext::open(config)?;
            let storage = ctx.open_storage(&id)?;
            println!("storage            {}", storage.storage_id());
            println!("transient          {}", storage.is_transient());
            println!("entries            {} / {}", storage.num_entries(), storage.max_entries());
            println!("bytes              {} / {}", storage.num_bytes(), storage.max_bytes());
            println!("persistent entries {}", storage.num_persistent_entries());
            println!("persistent bytes   {}", storage.num_persistent_bytes());
            if let Some(threshold) = ctx.events().threshold_of(&id) {
                println!("threshold          {threshold}");
            }
            let meat = ctx.meat_store().stats();
            println!(
                "payload store      slots={} resident_bytes={} inserted={} discarded={} expired={}",
                meat.slots, meat.resident_bytes, meat.inserted, meat.discarded, meat.expired
            );
            let next = meat
                .expiry
                .next_deadline
                .map_or_else(|| "-".to_string(), |at| at.to_string());
            println!("expiry timers      pending={} next_deadline_ms={next}", meat.expiry.pending);
            ctx.shutdown();
            Ok(0)
        }
        Command::Verify { storage_id } => {
            let id = StorageId::parse(&storage_id)?;
            let settings = config.queue_settings(id.prefix());
            let options = JournalOptions {
                fsync_every_n: config.journal.fsync_every_n,
                compact_min_bytes: config.journal.compact_min_bytes,
                discard_transient: false,
            };
            let queue = JournalQueue::open(
                id.clone(),
                settings.property(),
                &config.journal.directory,
                Arc::new(EntryFactory::new()),
                options,
            )?;
            let report = queue.recovery_report();
            info!(storage_id = %id, ?report, "journal verified");
            println!(
                "recovered={} corrupted={} truncated_bytes={}",
                report.recovered, report.corrupted, report.truncated_bytes
            );
            queue.shutdown();
            Ok(if report.corrupted > 0 { 2 } else { 0 })
        }
    }
}
