//! Static metric registry.
//!
//! The registry is the table of every metric the application may record:
//! identifier, type, lifetime, destination pings, and disabled flag. It is
//! built once at startup, either in code or from a TOML document:
//!
//! ```toml
//! pings = ["baseline"]
//!
//! [[metric]]
//! category = "app"
//! name = "launches"
//! type = "counter"
//! send_in_pings = ["metrics", "baseline"]
//!
//! [[metric]]
//! category = "app"
//! name = "flags"
//! type = "string_set"
//! lifetime = "user"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::types::{validate_ping_name, CommonMetricData, MetricId, MetricType, DEFAULT_PING};

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    pings: Vec<String>,
    #[serde(default, rename = "metric")]
    metrics: Vec<CommonMetricData>,
}

/// Every registered metric, keyed by type and identifier, plus the set of
/// known ping names.
#[derive(Debug, Clone)]
pub struct MetricRegistry {
    pings: BTreeSet<String>,
    metrics: BTreeMap<(MetricType, MetricId), CommonMetricData>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry {
    /// An empty registry that knows only the default ping.
    pub fn new() -> Self {
        Self {
            pings: BTreeSet::from([DEFAULT_PING.to_string()]),
            metrics: BTreeMap::new(),
        }
    }

    /// Declare a ping that exists even if no metric is sent in it yet.
    pub fn declare_ping(&mut self, ping: &str) -> Result<(), ConfigError> {
        validate_ping_name(ping)?;
        self.pings.insert(ping.to_string());
        Ok(())
    }

    /// Register one metric. `(category, name)` must be unique within the
    /// metric's type.
    pub fn register(&mut self, mut meta: CommonMetricData) -> Result<(), ConfigError> {
        let id = meta.id()?;
        meta.send_in_pings = meta.pings();
        for ping in &meta.send_in_pings {
            validate_ping_name(ping)?;
        }
        let key = (meta.metric_type, id);
        if self.metrics.contains_key(&key) {
            return Err(ConfigError::DuplicateMetric {
                metric_type: meta.metric_type,
                full_name: meta.full_name(),
            });
        }
        self.pings.extend(meta.send_in_pings.iter().cloned());
        self.metrics.insert(key, meta);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_metric(mut self, meta: CommonMetricData) -> Result<Self, ConfigError> {
        self.register(meta)?;
        Ok(self)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let file: RegistryFile = toml::from_str(s).map_err(|e| ConfigError::Parse {
            what: "metric registry",
            reason: e.to_string(),
        })?;
        let mut registry = Self::new();
        for ping in &file.pings {
            registry.declare_ping(ping)?;
        }
        for meta in file.metrics {
            registry.register(meta)?;
        }
        Ok(registry)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Look up a registered metric.
    pub fn get(
        &self,
        metric_type: MetricType,
        category: &str,
        name: &str,
    ) -> Option<&CommonMetricData> {
        let id = MetricId {
            category: category.to_string(),
            name: name.to_string(),
        };
        self.metrics.get(&(metric_type, id))
    }

    pub fn metrics(&self) -> impl Iterator<Item = &CommonMetricData> {
        self.metrics.values()
    }

    /// Known ping names in sorted order.
    pub fn pings(&self) -> impl Iterator<Item = &str> {
        self.pings.iter().map(String::as_str)
    }

    pub fn is_known_ping(&self, ping: &str) -> bool {
        self.pings.contains(ping)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
