//! Error types for oopzbot-player
//!
//! None of these terminate the controller: each maps to a degradation
//! (skip the track, mute the actuator, keep stale state) at the call site.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the playback core
#[derive(Error, Debug)]
pub enum Error {
    /// Resolution did not answer within its timeout on the last attempt
    #[error("Resolution of {track} timed out after {timeout:?}")]
    ResolutionTimeout { track: String, timeout: Duration },

    /// Resolution failed (provider error, missing audio URL, ...)
    #[error("Resolution of {track} failed: {reason}")]
    ResolutionFailed { track: String, reason: String },

    /// No actuator backend is able to render audio
    #[error("Actuator unavailable: {0}")]
    ActuatorUnavailable(String),

    /// The agent is up but refused to play a stream (expired or invalid URL)
    #[error("Stream {stream} rejected: {reason}")]
    StreamRejected { stream: String, reason: String },

    /// Writing to the shared state store failed
    #[error("State store write failed: {0}")]
    StoreWriteFailed(String),

    /// A command that could not be decoded
    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    /// remove/promote with an index outside the queue
    #[error("Queue index {index} out of range (queue length {len})")]
    QueueIndexInvalid { index: usize, len: usize },

    /// The controller task has shut down
    #[error("Playback controller is not running")]
    ControllerGone,

    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client errors (resolver, WebDriver)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encode/decode errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn resolution_failed(track: impl ToString, reason: impl ToString) -> Self {
        Self::ResolutionFailed {
            track: track.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether a resolution error is worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ResolutionTimeout { .. }
                | Error::ResolutionFailed { .. }
                | Error::Http(_)
                | Error::StoreWriteFailed(_)
                | Error::Database(_)
        )
    }
}

impl From<oopzbot_common::Error> for Error {
    fn from(err: oopzbot_common::Error) -> Self {
        match err {
            oopzbot_common::Error::Database(e) => Error::Database(e),
            oopzbot_common::Error::Io(e) => Error::Io(e),
            oopzbot_common::Error::Json(e) => Error::Json(e),
            oopzbot_common::Error::Config(msg) => Error::Config(msg),
            oopzbot_common::Error::MalformedCommand(msg) => Error::MalformedCommand(msg),
            oopzbot_common::Error::InvalidInput(msg) => Error::Internal(msg),
        }
    }
}

/// Convenience Result type using oopzbot-player Error
pub type Result<T> = std::result::Result<T, Error>;
