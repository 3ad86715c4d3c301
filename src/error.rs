//! Error types for the backup and restore engine.
//!
//! Core modules return [`FirebakError`]; command handlers wrap it in
//! `anyhow` with the target or collection name attached.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FirebakError {
    /// A request to the database failed or returned a non-success status.
    #[error("request to {url} failed: {reason}")]
    Network { url: String, reason: String },

    /// The rules document did not parse after comments were stripped.
    #[error("rules document is not valid JSON after removing comments: {0}")]
    MalformedRules(#[source] serde_json::Error),

    /// An annotation did not carry a usable `<marker>:shard:<N>` directive.
    #[error("invalid shard directive '{directive}' at '{path}': {reason}")]
    InvalidShardDirective {
        path: String,
        directive: String,
        reason: String,
    },

    /// Reading or writing a local file failed.
    #[error("{action} {}: {source}", path.display())]
    FileIo {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// One or more writes of a restore batch failed. Earlier writes stay applied.
    #[error("{failed} of {attempted} writes failed in batch {batch}: {first_error}")]
    PartialWrite {
        batch: usize,
        attempted: usize,
        failed: usize,
        first_error: String,
    },

    /// A full page came back without moving the cursor forward.
    #[error("pagination of '{path}' stalled at cursor '{cursor}'")]
    PaginationStalled { path: String, cursor: String },

    /// A row of a backup file could not be read as a path/value pair.
    #[error("malformed record in {} at line {line}: {reason}", path.display())]
    MalformedRecord {
        path: PathBuf,
        line: u64,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, FirebakError>;

impl FirebakError {
    pub fn file_io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FirebakError::FileIo {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn network(url: impl Into<String>, reason: impl ToString) -> Self {
        FirebakError::Network {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}
