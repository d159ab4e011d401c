use thiserror::Error;

/// Errors that can occur when using the message bus.
#[derive(Debug, Error)]
pub enum MessageBusError {
    /// The bus was used before `initialize` (or after `disconnect`).
    #[error("Message bus is not initialized")]
    NotInitialized,

    /// No correlated response arrived in time.
    #[error(
        "Timed out after {timeout_ms}ms waiting for response on {topic} (correlation ID {correlation_id})"
    )]
    Timeout {
        topic: String,
        correlation_id: String,
        timeout_ms: u64,
    },

    /// The topic does not exist on the broker.
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// The broker rejected or failed an operation.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The bus was disconnected while a request was waiting for its response.
    #[error("Message bus disconnected while awaiting a response")]
    Disconnected,

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MessageBusError {
    /// Returns true for the distinguished timeout kind.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MessageBusError::Timeout { .. })
    }
}

/// Result type for message bus operations.
pub type Result<T> = std::result::Result<T, MessageBusError>;
