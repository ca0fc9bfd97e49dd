/*!
Error types for the Thaw core engine.
*/

use thiserror::Error;

/// Result type used throughout the Thaw core.
pub type Result<T> = std::result::Result<T, ThawError>;

/// Errors that can occur while staging, flushing or restoring snapshots.
#[derive(Error, Debug)]
pub enum ThawError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// The snapshot blob could not be parsed back into archive entries
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    /// The remote object does not exist (yet)
    #[error("Snapshot not found: {key}")]
    NotFound { key: String },

    /// Object store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Filesystem notifier errors
    #[error("Watch error: {0}")]
    Watch(String),

    /// Configuration validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl ThawError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new corrupt archive error
    pub fn corrupt_archive<S: Into<String>>(msg: S) -> Self {
        Self::CorruptArchive(msg.into())
    }

    /// Create a new not-found error for the given key
    pub fn not_found<S: Into<String>>(key: S) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new watch error
    pub fn watch<S: Into<String>>(msg: S) -> Self {
        Self::Watch(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// True when the error only means there is nothing to restore.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<notify::Error> for ThawError {
    fn from(err: notify::Error) -> Self {
        Self::Watch(err.to_string())
    }
}
