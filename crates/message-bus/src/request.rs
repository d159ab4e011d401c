//! Correlation-ID request/response support.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::handler::{HandlerResult, InboundMessage, MessageHandler};

/// Field carrying the correlation ID on requests and their responses.
pub const CORRELATION_ID_FIELD: &str = "correlationId";

/// Pending requests keyed by correlation ID.
pub(crate) type PendingRequests = Arc<DashMap<String, oneshot::Sender<Value>>>;

/// One request in a `MessageBus::request_response` batch.
#[derive(Debug, Clone)]
pub struct ResponseRequest {
    /// Topic the request is published to.
    pub request_topic: String,
    /// Request body. The correlation ID is added before publishing.
    pub message: Value,
    /// Topic the responder replies on.
    pub response_topic: String,
    /// Consumer group used for the response subscription.
    pub group_id: String,
    /// Per-request timeout; the bus default applies when unset.
    pub timeout: Option<Duration>,
}

impl ResponseRequest {
    pub fn new(
        request_topic: impl Into<String>,
        message: Value,
        response_topic: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            request_topic: request_topic.into(),
            message,
            response_topic: response_topic.into(),
            group_id: group_id.into(),
            timeout: None,
        }
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Adds the correlation ID to a request body.
///
/// Objects get the field inserted; any other JSON value is wrapped as
/// `{correlationId, payload}`.
pub(crate) fn attach_correlation_id(message: Value, correlation_id: &str) -> Value {
    let id = Value::String(correlation_id.to_string());
    match message {
        Value::Object(mut map) => {
            map.insert(CORRELATION_ID_FIELD.to_string(), id);
            Value::Object(map)
        }
        other => {
            let mut map = Map::new();
            map.insert(CORRELATION_ID_FIELD.to_string(), id);
            map.insert("payload".to_string(), other);
            Value::Object(map)
        }
    }
}

/// Completes pending requests from messages on a response topic.
pub(crate) struct CorrelationResolver {
    pub(crate) pending: PendingRequests,
}

#[async_trait]
impl MessageHandler for CorrelationResolver {
    async fn handle(&self, message: InboundMessage) -> HandlerResult {
        let Some(correlation_id) = message
            .payload
            .get(CORRELATION_ID_FIELD)
            .and_then(Value::as_str)
        else {
            tracing::debug!(topic = %message.topic, "response without correlation ID ignored");
            return Ok(());
        };

        match self.pending.remove(correlation_id) {
            Some((_, resolver)) => {
                // The waiter may have just timed out; nothing to do then.
                let _ = resolver.send(message.payload);
            }
            None => {
                tracing::debug!(
                    topic = %message.topic,
                    %correlation_id,
                    "no pending request for response (late or duplicate)"
                );
            }
        }
        Ok(())
    }
}
