//! Error types shared by the SPL crates

use thiserror::Error;

/// Result type alias for shared SPL operations
pub type Result<T> = std::result::Result<T, SplError>;

/// Errors raised by the shared utilities
#[derive(Error, Debug)]
pub enum SplError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Unsupported checksum algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

impl SplError {
    /// Whether this error reports corrupted data rather than an I/O condition
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, SplError::ChecksumMismatch { .. })
    }
}
