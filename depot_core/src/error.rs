//! Error types for depot_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using depot_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during repository operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Repository root is missing, unwritable or the configuration is invalid.
    #[error("Invalid configuration for {path}: {reason}")]
    Configuration { path: PathBuf, reason: String },

    /// No stored content for the requested hash.
    #[error("Content not found: {hash}")]
    NotFound { hash: String },

    /// Explode was invoked on content that is not a recognized archive.
    #[error("Cannot explode content {hash}: {reason}")]
    ExplodedContent { hash: String, reason: String },

    /// Contract violation on a content item.
    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    /// A shard path segment exists but is not a writable directory.
    #[error("Filesystem error at {path}: {reason}")]
    Filesystem { path: PathBuf, reason: String },

    /// Invalid hash format or encoding.
    #[error("Invalid hash: {reason}")]
    InvalidHash { reason: String },

    /// Invalid directory entry (child name or conflicting archive paths).
    #[error("Invalid entry: {reason}")]
    InvalidEntry { reason: String },

    /// Stored content does not match its hash or cannot be decoded.
    #[error("Corrupted content {hash}: {reason}")]
    CorruptedContent { hash: String, reason: String },

    /// A directory operation was addressed to a leaf.
    #[error("Content {hash} is not a directory")]
    NotADirectory { hash: String },

    /// Unsupported algorithm.
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },
}

impl Error {
    /// Create a Configuration error.
    pub fn configuration(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Configuration {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a NotFound error.
    pub fn not_found(hash: impl Into<String>) -> Self {
        Error::NotFound { hash: hash.into() }
    }

    /// Create an ExplodedContent error.
    pub fn exploded_content(hash: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ExplodedContent {
            hash: hash.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidState error.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Error::InvalidState {
            reason: reason.into(),
        }
    }

    /// Create a Filesystem error.
    pub fn filesystem(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Filesystem {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidHash error.
    pub fn invalid_hash(reason: impl Into<String>) -> Self {
        Error::InvalidHash {
            reason: reason.into(),
        }
    }

    /// Create an InvalidEntry error.
    pub fn invalid_entry(reason: impl Into<String>) -> Self {
        Error::InvalidEntry {
            reason: reason.into(),
        }
    }

    /// Create a CorruptedContent error.
    pub fn corrupted_content(hash: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::CorruptedContent {
            hash: hash.into(),
            reason: reason.into(),
        }
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(hash: impl Into<String>) -> Self {
        Error::NotADirectory { hash: hash.into() }
    }

    /// Create an UnsupportedAlgorithm error.
    pub fn unsupported_algorithm(algorithm: impl Into<String>) -> Self {
        Error::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }

    /// Whether this error means the addressed content does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

// Additional From implementations for external error types

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
