//! Error types for artifact-forwarder.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The caller no longer holds the claim on this item (lease expired and
    /// another worker took it over, or it was already resolved).
    #[error("lease lost on work item {id} (worker {worker})")]
    LeaseLost { id: String, worker: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
