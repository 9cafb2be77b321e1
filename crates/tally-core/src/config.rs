//! tally.toml configuration parser.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::value::Limits;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    /// Directory holding the durable store. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub upload_enabled: bool,
    /// Start each application session with an empty `Application` scope.
    pub clear_application_lifetime_on_init: bool,
    /// Write `Ping`-lifetime values through to disk so uncollected data
    /// survives a restart.
    pub persist_ping_lifetime: bool,
    pub max_events: usize,
    pub max_string_list_length: usize,
    pub max_string_length: usize,
    pub writer: WriterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum queued writes applied in one storage transaction.
    pub batch_size: usize,
    /// Writes that may wait for the writer thread. When the queue is full
    /// the write's lifetime scope falls back to memory only.
    pub queue_capacity: usize,
    /// How long `flush` and `shutdown` wait for the writer to drain.
    pub flush_timeout_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            queue_capacity: 10_000,
            flush_timeout_ms: 5000,
        }
    }
}

impl Default for TallyConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            data_dir: None,
            upload_enabled: true,
            clear_application_lifetime_on_init: true,
            persist_ping_lifetime: true,
            max_events: limits.max_events,
            max_string_list_length: limits.max_string_list_length,
            max_string_length: limits.max_string_length,
            writer: WriterConfig::default(),
        }
    }
}

impl TallyConfig {
    /// Configuration persisting under `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Self::default()
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TallyConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_string_length: self.max_string_length,
            max_string_list_length: self.max_string_list_length,
            max_events: self.max_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TallyConfig::default();
        assert!(config.data_dir.is_none());
        assert!(config.upload_enabled);
        assert!(config.clear_application_lifetime_on_init);
        assert!(config.persist_ping_lifetime);
        assert_eq!(config.limits(), Limits::default());
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
data_dir = "/var/lib/tally"
max_events = 10

[writer]
batch_size = 8
"#;
        let config: TallyConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/tally")));
        assert_eq!(config.max_events, 10);
        assert_eq!(config.max_string_length, 100);
        assert_eq!(config.writer.batch_size, 8);
        assert_eq!(config.writer.queue_capacity, 10_000);
        assert_eq!(config.writer.flush_timeout_ms, 5000);
    }

    #[test]
    fn test_round_trip() {
        let config = TallyConfig::with_data_dir("/tmp/tally");
        let toml_str = config.to_toml_string().unwrap();
        let parsed: TallyConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
    }
}
