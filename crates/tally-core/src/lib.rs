pub mod config;
pub mod error;
pub mod registry;
pub mod types;
pub mod value;

pub use config::{TallyConfig, WriterConfig};
pub use error::ConfigError;
pub use registry::MetricRegistry;
pub use types::*;
pub use value::{CodecError, EventRecord, Limits, Merged, MetricValue, Sanitized};
