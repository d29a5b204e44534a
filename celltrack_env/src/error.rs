//! Error types for the environment abstraction layer.

use thiserror::Error;

/// Errors that can occur at the process boundary.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Underlying filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another tracker instance owns the output directory
    #[error("Lock already held: {0}")]
    LockHeld(String),

    /// Scan source file could not be decoded
    #[error("Scan source parse error: {0}")]
    Parse(String),

    /// Requested scan index past the end of the source
    #[error("Scan {index} out of range ({count} scans available)")]
    ScanOutOfRange { index: usize, count: usize },
}

impl EnvError {
    /// Creates a parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }
}
