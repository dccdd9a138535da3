//! Error types for rombox_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using rombox_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during depot, index and hashing operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Input path does not exist.
    #[error("Not found: {path}")]
    NotFound { path: PathBuf },

    /// Container has a bad name, is truncated, or fails verification.
    #[error("Malformed container at {path}: {reason}")]
    MalformedContainer { path: PathBuf, reason: String },

    /// The hash-record index could not be read or written.
    #[error("Index persistence failed: {reason}")]
    PersistenceFailure { reason: String },

    /// A freshly encoded container could not be moved into the depot.
    #[error("Failed to move {from} to {to}: {source}")]
    MoveFailure {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    /// Invalid hash format or encoding.
    #[error("Invalid hash: {reason}")]
    InvalidHash { reason: String },

    /// Configuration could not be parsed or is unusable.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The DAT collaborator failed to produce items for a descriptor.
    #[error("Failed to read DAT {path}: {reason}")]
    DatSource { path: PathBuf, reason: String },
}

impl Error {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Error::NotFound { path: path.into() }
    }

    /// Create a MalformedContainer error.
    pub fn malformed_container(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::MalformedContainer {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a PersistenceFailure error.
    pub fn persistence(reason: impl Into<String>) -> Self {
        Error::PersistenceFailure {
            reason: reason.into(),
        }
    }

    /// Create a MoveFailure error.
    pub fn move_failure(
        from: impl Into<PathBuf>,
        to: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Error::MoveFailure {
            from: from.into(),
            to: to.into(),
            source,
        }
    }

    /// Create an InvalidHash error.
    pub fn invalid_hash(reason: impl Into<String>) -> Self {
        Error::InvalidHash {
            reason: reason.into(),
        }
    }

    /// Create an InvalidConfig error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a DatSource error.
    pub fn dat_source(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::DatSource {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<ignore::Error> for Error {
    fn from(err: ignore::Error) -> Self {
        // ignore::Error can wrap an io::Error or be a path error
        match err.io_error() {
            Some(io_err) => Error::Io {
                source: std::io::Error::new(io_err.kind(), io_err.to_string()),
            },
            None => Error::Io {
                source: std::io::Error::other(err.to_string()),
            },
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::invalid_config(err.to_string())
    }
}
