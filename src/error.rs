//! # Error Types
//!
//! Crate-level error type for telemon using `thiserror`.
//!
//! Per-field and per-record problems have their own error types
//! ([`crate::pipeline::FieldError`], [`crate::protocol::record::ParseError`])
//! because they never leave the pipeline: they are absorbed and turned into
//! placeholders or dropped records. Only the variants here reach callers.

use thiserror::Error;

/// Main error type for telemon
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Serial port could not be opened or configured
    #[error("Serial port error: {0}")]
    Serial(String),

    /// I/O failure on an open device; fatal to that port's session only
    #[error("Device error on {port}: {message}")]
    Device { port: String, message: String },

    /// Operation not valid for the session's current mode or state
    #[error("Session error: {0}")]
    Session(String),

    /// The session has been closed
    #[error("Session for {0} is closed")]
    SessionClosed(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for telemon
pub type Result<T> = std::result::Result<T, MonitorError>;
