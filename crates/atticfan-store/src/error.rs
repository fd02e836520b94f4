//! Error types for atticfan-store.

use std::path::PathBuf;

/// Result type for atticfan-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in atticfan-store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read a data file.
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write or replace a data file.
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to create the directory holding a data file.
    #[error("Failed to create data directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The high/low log could not be read or appended.
    #[error("High/low log error in {path}: {source}")]
    HighLow { path: PathBuf, source: csv::Error },

    /// A write was requested while another one is still running.
    #[error("A data write is already in progress")]
    WriteInFlight,

    /// The background write task panicked or was cancelled.
    #[error("Write task failed: {0}")]
    WriteTask(String),

    /// A newer write of the same file started first; this one was dropped.
    #[error("Write of {path} superseded by a newer write")]
    Superseded { path: PathBuf },

    /// A query result could not be encoded as JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
