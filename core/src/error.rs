//! Error types for notifybus-core

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in notifybus-core
#[derive(Error, Debug)]
pub enum Error {
    /// Operation invoked before the listener loop was ever started
    #[error("{0} called before start_loop")]
    NotStarted(&'static str),

    /// Backend has no LISTEN/NOTIFY support
    #[error("unsupported backend: {0}")]
    Unsupported(String),

    /// No Tokio runtime to spawn the listener task on
    #[error("no tokio runtime available to spawn the listener loop")]
    NoRuntime,

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The listening connection dropped and its LISTEN state is gone
    #[error("listening connection lost")]
    ConnectionLost,

    /// A subscriber callback panicked
    #[error("callback for channel {channel} panicked: {message}")]
    Callback { channel: String, message: String },

    /// JSON serialization/deserialization failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}
