//! BlipStore – the storage core of a message broker.
//!
//! This crate exports
//!  * `core`    – entries, the payload store, priority queues and their
//!    journal, blocking access and threshold events
//!  * `config`  – TOML-driven runtime configuration
//!  * `logging` – `tracing` subscriber setup
//!
//! Embedders open a [`StoreContext`] and obtain storages by [`StorageId`].

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{load_config, StoreConfig};
pub use core::blocking::BlockingQueueWrapper;
pub use core::context::StoreContext;
pub use core::entry::Entry;
pub use core::error::{Result, StoreError};
pub use core::events::{EventHelper, StorageEventHandler};
pub use core::factory::EntryFactory;
pub use core::storage::{PutOutcome, Storage};
pub use core::storage_id::StorageId;
