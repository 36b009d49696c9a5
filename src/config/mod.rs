use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::core::events::EventHelper;
use crate::core::storage::{QueueProperty, StorageKind};

pub const DEFAULT_QUEUE_KEY: &str = "default";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalConfig {
    pub directory: PathBuf,
    pub fsync_every_n: Option<usize>,
    pub compact_min_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingConfig {
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeatConfig {
    /// Negative disables swapping under memory pressure.
    pub max_resident_bytes: i64,
    /// `0` disables the background expiry sweeper.
    pub expiry_sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub kind: StorageKind,
    pub max_entries: i64,
    pub max_bytes: i64,
    pub cache_max_entries: i64,
    pub embedded: bool,
}

impl QueueSettings {
    pub fn property(&self) -> QueueProperty {
        QueueProperty {
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
            cache_max_entries: self.cache_max_entries,
            embedded: self.embedded,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        let property = QueueProperty::default();
        Self {
            kind: StorageKind::default(),
            max_entries: property.max_entries,
            max_bytes: property.max_bytes,
            cache_max_entries: property.cache_max_entries,
            embedded: property.embedded,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub node_id: String,
    pub journal: JournalConfig,
    pub blocking: BlockingConfig,
    pub meat: MeatConfig,
    pub default_queue: QueueSettings,
    /// Per storage-id prefix overrides of `default_queue`.
    pub queues: HashMap<String, QueueSettings>,
    pub thresholds: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::resolve(FileConfig::default())
    }
}

// ───────────────────────────────────────────────────────────
// File layout; every field optional
// ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone, Default)]
struct FileConfig {
    node_id: Option<String>,
    journal: Option<FileJournal>,
    blocking: Option<FileBlocking>,
    meat: Option<FileMeat>,
    queues: Option<HashMap<String, FileQueue>>,
    events: Option<FileEvents>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct FileJournal {
    directory: Option<String>,
    fsync_every_n: Option<usize>,
    compact_min_bytes: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct FileBlocking {
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct FileMeat {
    max_resident_bytes: Option<i64>,
    expiry_sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct FileQueue {
    kind: Option<StorageKind>,
    max_entries: Option<i64>,
    max_bytes: Option<i64>,
    cache_max_entries: Option<i64>,
    embedded: Option<bool>,
}

impl FileQueue {
    fn over(&self, base: &QueueSettings) -> QueueSettings {
        QueueSettings {
            kind: self.kind.unwrap_or(base.kind),
            max_entries: self.max_entries.unwrap_or(base.max_entries),
            max_bytes: self.max_bytes.unwrap_or(base.max_bytes),
            cache_max_entries: self.cache_max_entries.unwrap_or(base.cache_max_entries),
            embedded: self.embedded.unwrap_or(base.embedded),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
struct FileEvents {
    thresholds: Option<Vec<String>>,
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::Parse(format!("{name}: {e}"))),
        Err(_) => Ok(None),
    }
}

impl StoreConfig {
    fn load_file<P: AsRef<Path>>(path: P) -> Result<FileConfig, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    fn resolve(file: FileConfig) -> Self {
        let journal = file.journal.unwrap_or_default();
        let blocking = file.blocking.unwrap_or_default();
        let meat = file.meat.unwrap_or_default();
        let mut file_queues = file.queues.unwrap_or_default();

        let default_queue = file_queues
            .remove(DEFAULT_QUEUE_KEY)
            .map(|q| q.over(&QueueSettings::default()))
            .unwrap_or_default();
        let queues = file_queues
            .into_iter()
            .map(|(prefix, q)| {
                let settings = q.over(&default_queue);
                (prefix, settings)
            })
            .collect();

        Self {
            node_id: file.node_id.unwrap_or_else(|| "blipstore".to_string()),
            journal: JournalConfig {
                directory: PathBuf::from(journal.directory.unwrap_or_else(|| "blipstore-data".to_string())),
                fsync_every_n: journal.fsync_every_n,
                compact_min_bytes: journal.compact_min_bytes.unwrap_or(4 * 1024 * 1024),
            },
            blocking: BlockingConfig {
                poll_interval_ms: blocking.poll_interval_ms.unwrap_or(1000),
            },
            meat: MeatConfig {
                max_resident_bytes: meat.max_resident_bytes.unwrap_or(-1),
                expiry_sweep_interval_ms: meat.expiry_sweep_interval_ms.unwrap_or(1000),
            },
            default_queue,
            queues,
            thresholds: file.events.and_then(|e| e.thresholds).unwrap_or_default(),
        }
    }

    /// Parses TOML text without looking at the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(raw)?;
        let config = Self::resolve(file);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file path and environment variables.
    ///
    /// Precedence: file values provide defaults, environment variables override.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let env_path = env::var("BLIPSTORE_CONFIG").ok();
        let effective_path = path.map(|s| s.to_string()).or(env_path);

        let file_cfg = if let Some(p) = effective_path {
            Self::load_file(p)?
        } else {
            FileConfig::default()
        };
        let mut config = Self::resolve(file_cfg);

        // Env overrides.
        if let Ok(v) = env::var("BLIPSTORE_NODE_ID") {
            config.node_id = v;
        }

        if let Ok(v) = env::var("BLIPSTORE_JOURNAL_DIR") {
            config.journal.directory = PathBuf::from(v);
        }

        if let Some(n) = parse_env::<usize>("BLIPSTORE_FSYNC_EVERY_N")? {
            config.journal.fsync_every_n = (n > 0).then_some(n);
        }

        if let Some(ms) = parse_env::<u64>("BLIPSTORE_POLL_INTERVAL_MS")? {
            config.blocking.poll_interval_ms = ms;
        }

        if let Ok(v) = env::var("BLIPSTORE_THRESHOLDS") {
            config.thresholds = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects configuration that would otherwise fail on first use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Parse("node_id must not be empty".into()));
        }
        if self.blocking.poll_interval_ms == 0 {
            return Err(ConfigError::Parse("blocking.poll_interval_ms must be positive".into()));
        }
        for rule in &self.thresholds {
            EventHelper::parse(rule).map_err(|e| ConfigError::Parse(e.to_string()))?;
        }
        Ok(())
    }

    /// Settings for storages whose id starts with `prefix`.
    pub fn queue_settings(&self, prefix: &str) -> QueueSettings {
        self.queues.get(prefix).copied().unwrap_or(self.default_queue)
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<StoreConfig, ConfigError> {
    let path = path.as_ref().to_string_lossy().into_owned();
    StoreConfig::load(Some(&path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = StoreConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.blocking.poll_interval_ms, 1000);
        assert_eq!(cfg.default_queue.kind, StorageKind::Cache);
        assert!(cfg.thresholds.is_empty());
    }

    #[test]
    fn prefix_settings_inherit_default() {
        let cfg = StoreConfig::from_toml_str(
            r#"
            [queues.default]
            max_entries = 50

            [queues.history]
            kind = "ram"
            "#,
        )
        .unwrap();
        let history = cfg.queue_settings("history");
        assert_eq!(history.kind, StorageKind::Ram);
        assert_eq!(history.max_entries, 50);
        assert_eq!(cfg.queue_settings("callback").max_entries, 50);
    }

    #[test]
    fn invalid_threshold_is_rejected_at_load() {
        let err = StoreConfig::from_toml_str(
            r#"
            [events]
            thresholds = ["topic/t/queue/history/event/threshold.x"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
