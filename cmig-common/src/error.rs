//! Errors raised by the shared configuration, logging and timestamp helpers

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Artifact store and root folder I/O
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML file unreadable or invalid, or a bad log level
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stored timestamp that is not RFC 3339
    #[error("Invalid timestamp in {field}: {reason}")]
    Timestamp { field: String, reason: String },

    /// The global tracing subscriber was already installed
    #[error("Logging setup failed: {0}")]
    Logging(String),
}
