//! tally-state: durable storage for recorded metric values.
//!
//! Backed by [redb](https://docs.rs/redb). Each lifetime scope has its own
//! table, so a scope can be loaded or wiped independently. Records are
//! JSON-serialized [`StoredRecord`]s carrying their own type, ping, and
//! identifier, which makes the file self-describing on reload.
//!
//! Writes normally go through [`StateWriter`], a dedicated thread that
//! applies queued operations in batches so recording threads never wait on
//! disk.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;
pub mod writer;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
pub use writer::{StateWriter, WriteTarget, WriterHandle};

/// File name of the database inside a data directory.
pub const STORE_FILE_NAME: &str = "tally.redb";
