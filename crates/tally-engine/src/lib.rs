//! tally-engine: lifetime-aware metric storage.
//!
//! One [`StorageEngine`] per metric type holds values per ping and applies
//! the type's merge rule on every record. [`Tally`] owns the engines, the
//! static [`PingRegistry`], and the background state writer, and assembles
//! per-ping [`Snapshot`]s at collection time.
//!
//! # Lifetimes
//!
//! | lifetime      | cleared by                                   |
//! |---------------|----------------------------------------------|
//! | `Ping`        | collecting the ping                          |
//! | `Application` | the next `init` (configurable), or a reset   |
//! | `User`        | `wipe_all` / `clear_lifetime` only            |
//!
//! # Concurrency
//!
//! Every (engine, ping) pair has its own lock. `collect` holds the locks of
//! all contributing engines for that ping across the read and the clear, so
//! no `record` is lost between them and no caller sees a half-cleared ping.
//! Collecting one ping never blocks recording into another.

pub mod error;
pub mod error_metrics;
pub mod registry;
pub mod snapshot;
pub mod storage;
pub mod tally;

pub use error::RecordError;
pub use error_metrics::error_metric_name;
pub use registry::PingRegistry;
pub use snapshot::Snapshot;
pub use storage::{RecordOutcome, StorageEngine};
pub use tally::Tally;
