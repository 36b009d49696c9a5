use std::io;

use thiserror::Error;

use crate::core::priority::Priority;
use crate::core::storage_id::StorageId;

/// Every failure the storage core surfaces to callers.
///
/// Dirty-read misses on shared payloads are deliberately absent: they are
/// classified and logged by the reference link and never raised.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("internal error: {0}")]
    Internal(String),

    #[error("entry type '{0}' is not implemented")]
    NotImplemented(String),

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error(
        "version incompatible record for type '{entry_type}': expected at least {expected} fields, got {got} (prio={priority}, timestamp={timestamp})"
    )]
    VersionIncompatible {
        entry_type: String,
        expected: usize,
        got: usize,
        priority: i32,
        timestamp: i64,
    },

    #[error(
        "could not decode entry of type '{entry_type}' in '{storage_id}' (prio={priority}, timestamp={timestamp}): {source}"
    )]
    Decode {
        storage_id: String,
        entry_type: String,
        priority: i32,
        timestamp: i64,
        #[source]
        source: Box<StoreError>,
    },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("queue '{storage_id}' is full ({num_entries}/{max_entries} entries, {num_bytes}/{max_bytes} bytes)")]
    QueueFull {
        storage_id: StorageId,
        num_entries: i64,
        max_entries: i64,
        num_bytes: i64,
        max_bytes: i64,
    },

    #[error("storage '{0}' is shut down")]
    Shutdown(StorageId),

    #[error("storage is gone")]
    StorageGone,

    #[error("payload '{key_oid}' ({unique_id}) is no longer stored")]
    PayloadGone { key_oid: String, unique_id: i64 },

    #[error("storage '{0}' already has a put listener registered")]
    PutListenerRegistered(StorageId),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("journal corruption: {0}")]
    Corruption(String),
}

impl StoreError {
    /// Tags a decode failure with the coordinates of the row it came from.
    pub fn decode(
        storage_id: Option<&StorageId>,
        entry_type: &str,
        priority: Priority,
        timestamp: i64,
        source: StoreError,
    ) -> Self {
        StoreError::Decode {
            storage_id: storage_id
                .map(ToString::to_string)
                .unwrap_or_else(|| "<unknown>".to_string()),
            entry_type: entry_type.to_string(),
            priority: priority.as_i32(),
            timestamp,
            source: Box::new(source),
        }
    }

    /// The innermost error behind any `Decode` wrapping.
    pub fn root_cause(&self) -> &StoreError {
        match self {
            StoreError::Decode { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, StoreError::Configuration(_))
    }

    /// Fatal errors point at a bug or a broken record rather than a
    /// transient condition like a full queue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Internal(_)
                | StoreError::NotImplemented(_)
                | StoreError::IllegalArgument(_)
                | StoreError::VersionIncompatible { .. }
                | StoreError::Decode { .. }
                | StoreError::Serialization(_)
                | StoreError::Corruption(_)
        )
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
