//! Error types for the timeline engine.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the timeline engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Event model / validation error.
    #[error("event error: {0}")]
    Event(#[from] tessera_core::Error),

    /// SQLite backing store error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Nostr SDK error.
    #[error("Nostr SDK error: {0}")]
    NostrSdk(#[from] nostr_sdk::client::Error),

    /// Transport-level failure (disconnect, timeout, rejected request).
    #[error("transport error: {0}")]
    Transport(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Background task failed to complete.
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
