//! Errors surfaced by the raw recording path.

use tally_core::{CodecError, ConfigError, ErrorType, Lifetime, MetricType};
use thiserror::Error;

/// Why a `record` call was refused. Nothing is stored when one of these is
/// returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("invalid metric identifier: {0}")]
    InvalidIdentifier(#[from] ConfigError),

    #[error("metric `{0}` declares no pings")]
    EmptyPingSet(String),

    #[error("ping `{0}` is not a destination of this metric")]
    UnknownPing(String),

    #[error("{metric_type} metric `{full_name}` is not registered")]
    UnknownMetric {
        metric_type: MetricType,
        full_name: String,
    },

    #[error("metric `{full_name}` is a {expected} metric, got a {found} value")]
    TypeMismatch {
        full_name: String,
        expected: MetricType,
        found: MetricType,
    },

    #[error("metric `{full_name}` is stored with {stored} lifetime, recorded with {requested}")]
    LifetimeMismatch {
        full_name: String,
        stored: Lifetime,
        requested: Lifetime,
    },

    #[error(transparent)]
    InvalidValue(#[from] CodecError),
}

impl RecordError {
    /// Which error counter the failure is reported under.
    pub fn error_type(&self) -> ErrorType {
        match self {
            RecordError::InvalidIdentifier(_)
            | RecordError::EmptyPingSet(_)
            | RecordError::UnknownPing(_)
            | RecordError::UnknownMetric { .. } => ErrorType::InvalidLabel,
            RecordError::TypeMismatch { .. } | RecordError::LifetimeMismatch { .. } => {
                ErrorType::InvalidState
            }
            RecordError::InvalidValue(e) => e.error_type(),
        }
    }
}
