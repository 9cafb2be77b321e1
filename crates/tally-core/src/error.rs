//! Configuration errors for metric identifiers, registries, and config files.

use thiserror::Error;

use crate::types::MetricType;

/// Problems with static metric configuration. These are programmer errors,
/// normally caught when the registry is built.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("metric `{name}` has an empty category")]
    EmptyCategory { name: String },

    #[error("metric in category `{category}` has an empty name")]
    EmptyName { category: String },

    #[error("invalid ping name `{0}`")]
    InvalidPingName(String),

    #[error("{metric_type} metric `{full_name}` is registered more than once")]
    DuplicateMetric {
        metric_type: MetricType,
        full_name: String,
    },

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },
}
