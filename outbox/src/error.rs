//! Error types for the outbox delivery engine.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
///
/// Everything below the scheduling façade (workers, scheduler, heartbeat)
/// logs and swallows these; the engine self-heals on subsequent ticks.
/// Errors raised by `Outbox::schedule` propagate to the caller so the
/// enclosing business transaction rolls back.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Invalid engine setup: duplicate handler registration, bad retry
    /// policy, invalid configuration value. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Payload could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A handler invocation failed; captured on the record
    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// Database operation failed
    #[error("Database error: {0}")]
    Store(#[from] sqlx::Error),

    /// Heartbeat, cleanup or partition assignment failed
    #[error("Coordination error: {0}")]
    Coordination(String),

    /// Record not found in the outbox table
    #[error("Record not found: {0}")]
    RecordNotFound(Uuid),

    /// Generic error with context
    #[error("Outbox error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A handler failure, recorded on the outbox record.
///
/// The `class` is a short, stable name for the failure category
/// (e.g. `"ValidationError"`, `"Timeout"`). Retry policies filter on it
/// via their include/exclude lists; the default class is `"error"`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{class}: {message}")]
pub struct DispatchError {
    pub class: String,
    pub message: String,
}

impl DispatchError {
    /// Create a dispatch error with an explicit class.
    pub fn with_class(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }

    /// Create a dispatch error with the default `"error"` class.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_class("error", message)
    }
}

impl From<anyhow::Error> for DispatchError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}
