//! Message handler trait and closure adapter.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Error type handlers may return. Errors are logged and swallowed by the
/// consumer loop.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by message handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// A decoded message handed to a handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Topic the message arrived on.
    pub topic: String,
    /// JSON body of the message.
    pub payload: serde_json::Value,
    /// When the broker accepted the message.
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    /// Deserializes the payload into a typed message.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Handles messages for one subscribed topic.
///
/// Invocations for the same subscription (group and topic) never overlap.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage) -> HandlerResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: InboundMessage) -> HandlerResult {
        (self.0)(message).await
    }
}

/// Wraps an async closure as a message handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
