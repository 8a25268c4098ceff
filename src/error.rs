//! Unified error types for the sync and classification core
//!
//! Errors fall into two buckets the scheduler cares about: transient
//! (network hiccups, timeouts) which are retried with backoff, and fatal
//! (authentication rejected) which disable the account until it is
//! reconfigured. Everything is serializable so the UI layer can consume
//! errors directly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error type for all engine operations
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl CoreError {
    /// Whether the scheduler should retry this failure with backoff.
    ///
    /// Auth failures are fatal per account; protocol and store failures are
    /// handled at the folder/cycle level and are not blanket-retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Network(_) | CoreError::Timeout(_))
    }

    /// Whether this failure should move the account to the terminal
    /// `Disabled` state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Auth(_))
    }
}

// Implement From for common error types

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for CoreError {
    fn from(err: toml::de::Error) -> Self {
        CoreError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Parse(err.to_string())
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Store(err.to_string())
    }
}

impl From<r2d2::Error> for CoreError {
    fn from(err: r2d2::Error) -> Self {
        CoreError::Store(err.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CoreError::Timeout(err.to_string())
        } else {
            CoreError::Network(err.to_string())
        }
    }
}

impl From<async_imap::error::Error> for CoreError {
    fn from(err: async_imap::error::Error) -> Self {
        use async_imap::error::Error as ImapError;
        match err {
            ImapError::Io(e) => CoreError::Network(e.to_string()),
            ImapError::ConnectionLost => CoreError::Network("connection lost".to_string()),
            other => CoreError::Protocol(other.to_string()),
        }
    }
}

/// Result type alias using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;
