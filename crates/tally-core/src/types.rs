//! Shared types used across Tally crates.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Ping every metric is sent in when it declares no pings of its own.
pub const DEFAULT_PING: &str = "metrics";

/// Category reserved for the metrics that count recording problems.
pub const ERROR_CATEGORY: &str = "tally.error";

/// How long a recorded value survives.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Lifetime {
    /// Cleared every time the ping it belongs to is collected.
    #[default]
    Ping,
    /// Survives collection; cleared when a new application session starts.
    Application,
    /// Survives restarts; cleared only by an explicit user reset.
    User,
}

impl Lifetime {
    pub const ALL: [Lifetime; 3] = [Lifetime::Ping, Lifetime::Application, Lifetime::User];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lifetime::Ping => "ping",
            Lifetime::Application => "application",
            Lifetime::User => "user",
        }
    }

    /// Stable position used to index per-scope tables and flags.
    pub fn index(&self) -> usize {
        match self {
            Lifetime::Ping => 0,
            Lifetime::Application => 1,
            Lifetime::User => 2,
        }
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of value kinds the engine stores. Each kind owns one
/// storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Boolean,
    Counter,
    Quantity,
    String,
    StringList,
    StringSet,
    Uuid,
    Event,
}

impl MetricType {
    pub const ALL: [MetricType; 8] = [
        MetricType::Boolean,
        MetricType::Counter,
        MetricType::Quantity,
        MetricType::String,
        MetricType::StringList,
        MetricType::StringSet,
        MetricType::Uuid,
        MetricType::Event,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Boolean => "boolean",
            MetricType::Counter => "counter",
            MetricType::Quantity => "quantity",
            MetricType::String => "string",
            MetricType::StringList => "string_list",
            MetricType::StringSet => "string_set",
            MetricType::Uuid => "uuid",
            MetricType::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        MetricType::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(category, name)` pair naming one slot of data within a metric type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetricId {
    pub category: String,
    pub name: String,
}

impl MetricId {
    /// Build an identifier, rejecting empty components.
    pub fn new(category: &str, name: &str) -> Result<Self, ConfigError> {
        if category.is_empty() {
            return Err(ConfigError::EmptyCategory {
                name: name.to_string(),
            });
        }
        if name.is_empty() {
            return Err(ConfigError::EmptyName {
                category: category.to_string(),
            });
        }
        Ok(Self {
            category: category.to_string(),
            name: name.to_string(),
        })
    }

    /// `category.name`, the key used in snapshots.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.category, self.name)
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.category, self.name)
    }
}

/// Static properties of one registered metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonMetricData {
    pub category: String,
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    #[serde(default)]
    pub lifetime: Lifetime,
    #[serde(default)]
    pub send_in_pings: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
}

impl CommonMetricData {
    pub fn new(category: &str, name: &str, metric_type: MetricType) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            metric_type,
            lifetime: Lifetime::Ping,
            send_in_pings: vec![DEFAULT_PING.to_string()],
            disabled: false,
        }
    }

    pub fn with_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_pings<I, S>(mut self, pings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send_in_pings = pings.into_iter().map(Into::into).collect();
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn id(&self) -> Result<MetricId, ConfigError> {
        MetricId::new(&self.category, &self.name)
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.category, self.name)
    }

    /// Declared pings, or the default ping when none are declared.
    pub fn pings(&self) -> Vec<String> {
        if self.send_in_pings.is_empty() {
            vec![DEFAULT_PING.to_string()]
        } else {
            self.send_in_pings.clone()
        }
    }
}

/// Kinds of recording problems counted by the error-metric channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// The value was rejected (non-positive counter amount, negative quantity).
    InvalidValue,
    /// The value was truncated or some items were dropped at a size cap.
    InvalidOverflow,
    /// The identifier or ping set did not match the registry.
    InvalidLabel,
    /// The value kind or lifetime conflicted with the registered metric.
    InvalidState,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::InvalidValue => "invalid_value",
            ErrorType::InvalidOverflow => "invalid_overflow",
            ErrorType::InvalidLabel => "invalid_label",
            ErrorType::InvalidState => "invalid_state",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ping names are lowercase ASCII words joined by `-` or `_`.
pub fn validate_ping_name(ping: &str) -> Result<(), ConfigError> {
    let valid = !ping.is_empty()
        && ping.len() <= 64
        && ping
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidPingName(ping.to_string()))
    }
}
