//! Error types for the larch storage engine.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The result type used throughout larch.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for larch operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error occurred on an already open file.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// On-disk structures failed validation.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// The on-disk format is newer or older than this build understands.
    #[error("Format version mismatch: {0}")]
    Version(String),

    /// The revision being read has been discarded by a writer.
    ///
    /// Recoverable: reopen the database and retry.
    #[error("Revision modified: {0}")]
    Modified(String),

    /// The table or database handle has been closed.
    #[error("Database has been closed")]
    Closed,

    /// A backing file could not be opened or created.
    #[error("Couldn't open {path:?}: {source}")]
    Opening {
        /// The file that failed to open.
        path: PathBuf,
        /// The underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// The request is valid but exceeds what the format can encode.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not permitted in the current mode.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a new revision-modified error.
    pub fn modified(msg: impl Into<String>) -> Self {
        Error::Modified(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new invalid operation error.
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    /// Creates a new unimplemented error.
    pub fn unimplemented(msg: impl Into<String>) -> Self {
        Error::Unimplemented(msg.into())
    }

    /// Wraps an I/O failure that happened while opening `path`.
    pub fn opening(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Opening { path: path.into(), source }
    }

    /// Returns true if reopening and retrying may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Modified(_))
    }
}
