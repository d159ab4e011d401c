//! Saga error types.

use message_bus::MessageBusError;
use state_store::StateStoreError;
use thiserror::Error;

/// Errors that can occur during saga coordination.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The coordinator was used before `initialize` (or after `disconnect`).
    #[error("Saga coordinator is not initialized")]
    NotInitialized,

    /// A start request was rejected before anything was persisted.
    #[error("Invalid transaction request: {0}")]
    InvalidRequest(String),

    /// A persisted transaction could not be decoded.
    #[error("Corrupt transaction state: {0}")]
    CorruptState(String),

    /// A control message did not match its topic's schema.
    #[error("Invalid message on {topic}: {reason}")]
    InvalidMessage { topic: String, reason: String },

    /// Message bus error.
    #[error("Message bus error: {0}")]
    MessageBus(#[from] MessageBusError),

    /// State store error.
    #[error("State store error: {0}")]
    StateStore(#[from] StateStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
