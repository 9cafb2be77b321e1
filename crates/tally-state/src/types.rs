//! Persisted record types.

use serde::{Deserialize, Serialize};
use tally_core::{Lifetime, MetricId, MetricType, MetricValue};

/// Separator between key components. Chosen outside the character set of
/// ping names so components cannot run into each other.
const KEY_SEPARATOR: char = '\u{1f}';

/// Location of one stored value: scope, metric type, ping, and identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub lifetime: Lifetime,
    pub metric_type: MetricType,
    pub ping: String,
    pub id: MetricId,
}

impl RecordKey {
    /// Composite key within the lifetime's table:
    /// `{type}␟{ping}␟{category}␟{name}`.
    pub fn table_key(&self) -> String {
        let sep = KEY_SEPARATOR;
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.metric_type, self.ping, self.id.category, self.id.name
        )
    }
}

/// One durable value as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub lifetime: Lifetime,
    pub metric_type: MetricType,
    pub ping: String,
    pub id: MetricId,
    pub value: MetricValue,
}

impl StoredRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            lifetime: self.lifetime,
            metric_type: self.metric_type,
            ping: self.ping.clone(),
            id: self.id.clone(),
        }
    }

    /// A record is consistent when its value matches its declared type.
    pub fn is_consistent(&self) -> bool {
        self.value.metric_type() == self.metric_type
    }
}

/// A queued change to durable state.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert or replace a record.
    Put(StoredRecord),
    /// Remove one record.
    Delete(RecordKey),
    /// Remove every record of one lifetime scope.
    Wipe(Lifetime),
}

impl WriteOp {
    /// Lifetime scope the operation touches.
    pub fn scope(&self) -> Lifetime {
        match self {
            WriteOp::Put(record) => record.lifetime,
            WriteOp::Delete(key) => key.lifetime,
            WriteOp::Wipe(lifetime) => *lifetime,
        }
    }
}
