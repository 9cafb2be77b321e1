//! State store failures.
//!
//! Every variant carries the backend's message. The engine treats all of
//! them alike: the affected lifetime scope keeps working in memory.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state store: {0}")]
    Open(String),

    #[error("storage transaction failed: {0}")]
    Transaction(String),

    #[error("lifetime table unavailable: {0}")]
    Table(String),

    #[error("storage I/O failed: {0}")]
    Storage(String),

    #[error("cannot encode record: {0}")]
    Encode(String),

    #[error("state writer thread did not start: {0}")]
    Worker(String),
}
