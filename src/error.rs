//! Error types for keygate

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for keygate
pub type Result<T> = std::result::Result<T, Error>;

/// keygate errors
///
/// Denied validations are not errors: they come back as a
/// [`Verdict`](crate::gate::Verdict). Unknown tokens or ban values on admin
/// mutations are reported through `bool`/`Option` return values instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A durable collection could not be read or written
    #[error("Storage error at {}: {source}", path.display())]
    Storage {
        /// File that failed
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: io::Error,
    },

    /// Malformed caller input (rejected at the boundary)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Custom key duration was not a positive number of hours
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    /// A key must admit at least one player
    #[error("maxUsers must be at least 1")]
    InvalidMaxUsers,

    /// Token already used by a live or retired key
    #[error("Token already exists: {0}")]
    DuplicateToken(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an I/O failure on a specific file.
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// `true` for errors caused by the caller rather than the server.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::InvalidDuration(_)
                | Self::InvalidMaxUsers
                | Self::DuplicateToken(_)
        )
    }
}
