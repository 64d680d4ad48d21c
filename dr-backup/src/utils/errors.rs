//! Error types for the backup pipeline.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DrError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Encryption key not available at {}: {reason}", path.display())]
    KeyMissing { path: PathBuf, reason: String },

    #[error("Required tool not found: {0}")]
    ToolMissing(String),

    #[error("{tool} exited with status {code:?}: {stderr}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{tool} timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Sink '{sink}' failed: {message}")]
    Sink { sink: String, message: String },

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Invalid session: {0}")]
    InvalidSession(String),
}

impl DrError {
    /// Missing hard prerequisites abort a run before any artifact work.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DrError::KeyMissing { .. } | DrError::ToolMissing(_))
    }

    pub fn sink(sink: &str, message: impl Into<String>) -> Self {
        DrError::Sink {
            sink: sink.to_string(),
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for DrError {
    fn from(e: config::ConfigError) -> Self {
        DrError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DrError>;
