//! The message bus service.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::broker::{Broker, Delivery, RecordSink, TopicConfig};
use crate::handler::{InboundMessage, MessageHandler};
use crate::request::{CorrelationResolver, PendingRequests, ResponseRequest, attach_correlation_id};
use crate::{MessageBusError, Result};

/// Message bus configuration.
#[derive(Debug, Clone)]
pub struct MessageBusConfig {
    /// Consumer group used when `subscribe` is called without one.
    pub default_group_id: String,
    /// Policy for topics the bus creates on first use.
    pub topic_config: TopicConfig,
    /// Request/response timeout when a request does not set its own.
    pub default_request_timeout: Duration,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            default_group_id: "default-group".to_string(),
            topic_config: TopicConfig::default(),
            default_request_timeout: Duration::from_secs(10),
        }
    }
}

/// One consumer task per (group, topic) subscription.
///
/// Records of one subscription are handled strictly in order; separate
/// subscriptions, including other topics of the same group, run concurrently.
struct Subscription {
    group_id: String,
    task: JoinHandle<()>,
}

impl Subscription {
    fn spawn(
        group_id: String,
        topic: String,
        handler: Arc<dyn MessageHandler>,
    ) -> (Self, RecordSink) {
        let (sink, deliveries) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_consumer(group_id.clone(), topic, deliveries, handler));
        (Self { group_id, task }, sink)
    }
}

#[derive(Default)]
struct BusState {
    initialized: bool,
    known_topics: HashSet<String>,
    /// Subscribed topic -> its consumer.
    subscriptions: HashMap<String, Subscription>,
}

/// Topic pub/sub and correlated request/response over a `Broker`.
///
/// Lifecycle: construct once per process, call `initialize` before use and
/// `disconnect` on shutdown. Both are idempotent. The bus is safe to share
/// (`Arc<MessageBus>`) between consumer callbacks and other tasks.
pub struct MessageBus {
    broker: Arc<dyn Broker>,
    config: MessageBusConfig,
    state: Mutex<BusState>,
    pending: PendingRequests,
}

impl MessageBus {
    /// Creates a bus over the given broker. No connection is made yet.
    pub fn new(broker: Arc<dyn Broker>, config: MessageBusConfig) -> Self {
        Self {
            broker,
            config,
            state: Mutex::new(BusState::default()),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Returns the bus configuration.
    pub fn config(&self) -> &MessageBusConfig {
        &self.config
    }

    /// Connects to the broker. Subsequent calls are no-ops while initialized.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.initialized {
            return Ok(());
        }

        self.broker.connect().await.map_err(|e| {
            tracing::error!(error = %e, "failed to connect to broker");
            e
        })?;
        state.initialized = true;
        tracing::info!("message bus initialized");
        Ok(())
    }

    /// Returns true between a successful `initialize` and `disconnect`.
    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.initialized
    }

    /// Publishes a message, creating the topic first if it does not exist.
    #[tracing::instrument(skip(self, message))]
    pub async fn publish<T: Serialize + ?Sized>(&self, topic: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;

        {
            let mut state = self.state.lock().await;
            if !state.initialized {
                return Err(MessageBusError::NotInitialized);
            }
            self.ensure_topic(&mut state, topic).await?;
        }

        self.broker.send(topic, payload).await.map_err(|e| {
            tracing::error!(%topic, error = %e, "failed to publish message");
            e
        })?;

        metrics::counter!("message_bus_published_total", "topic" => topic.to_string())
            .increment(1);
        tracing::debug!(%topic, "message published");
        Ok(())
    }

    /// Registers `handler` for `topic` under a consumer group.
    ///
    /// Uses the default group when `group_id` is `None`. Subscribing a topic
    /// that already has a subscription is a no-op. Every subscription gets its
    /// own consumer, so groups never steal each other's messages and a slow
    /// handler only holds back its own topic.
    #[tracing::instrument(skip(self, handler))]
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        group_id: Option<&str>,
    ) -> Result<()> {
        let group_id = group_id
            .unwrap_or(&self.config.default_group_id)
            .to_string();

        let mut state = self.state.lock().await;
        if !state.initialized {
            return Err(MessageBusError::NotInitialized);
        }
        if let Some(existing) = state.subscriptions.get(topic) {
            tracing::debug!(%topic, group_id = %existing.group_id, "topic already subscribed");
            return Ok(());
        }

        self.ensure_topic(&mut state, topic).await?;

        let (subscription, sink) =
            Subscription::spawn(group_id.clone(), topic.to_string(), handler);
        if let Err(e) = self.broker.subscribe(&group_id, topic, sink).await {
            subscription.task.abort();
            tracing::error!(%topic, %group_id, error = %e, "failed to subscribe");
            return Err(e);
        }

        state.subscriptions.insert(topic.to_string(), subscription);
        tracing::info!(%topic, %group_id, "subscribed to topic");
        Ok(())
    }

    /// Stops consuming `topic`. Returns false if it was not subscribed.
    ///
    /// A record whose handler is interrupted is not acknowledged, so a durable
    /// broker delivers it again on the next subscription.
    #[tracing::instrument(skip(self))]
    pub async fn unsubscribe(&self, topic: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(subscription) = state.subscriptions.remove(topic) else {
            return Ok(false);
        };

        subscription.task.abort();
        self.broker
            .unsubscribe(&subscription.group_id, topic)
            .await
            .map_err(|e| {
                tracing::error!(%topic, group_id = %subscription.group_id, error = %e, "failed to unsubscribe");
                e
            })?;
        tracing::info!(%topic, group_id = %subscription.group_id, "unsubscribed from topic");
        Ok(true)
    }

    /// Returns the currently subscribed topics, sorted.
    pub async fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .state
            .lock()
            .await
            .subscriptions
            .keys()
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    /// Sends a batch of correlated requests and waits for their responses.
    ///
    /// Requests run concurrently; each resolves independently with either the
    /// responder's message or an error. A timeout on one request does not
    /// cancel the others. Results are returned in request order.
    pub async fn request_response(&self, requests: Vec<ResponseRequest>) -> Vec<Result<Value>> {
        join_all(requests.into_iter().map(|request| self.request(request))).await
    }

    /// Returns the number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    #[tracing::instrument(
        skip(self, request),
        fields(request_topic = %request.request_topic, response_topic = %request.response_topic)
    )]
    async fn request(&self, request: ResponseRequest) -> Result<Value> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let timeout = request
            .timeout
            .unwrap_or(self.config.default_request_timeout);

        let (resolver, response) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), resolver);

        // Subscribe before publishing so a fast responder cannot be missed.
        let resolver_handler = Arc::new(CorrelationResolver {
            pending: self.pending.clone(),
        });
        if let Err(e) = self
            .subscribe(
                &request.response_topic,
                resolver_handler,
                Some(&request.group_id),
            )
            .await
        {
            self.pending.remove(&correlation_id);
            return Err(e);
        }

        let message = attach_correlation_id(request.message, &correlation_id);
        if let Err(e) = self.publish(&request.request_topic, &message).await {
            self.pending.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(MessageBusError::Disconnected),
            Err(_) => {
                self.pending.remove(&correlation_id);
                metrics::counter!("message_bus_request_timeouts_total").increment(1);
                tracing::warn!(%correlation_id, timeout_ms = timeout.as_millis() as u64, "request timed out");
                Err(MessageBusError::Timeout {
                    topic: request.response_topic,
                    correlation_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Stops all consumers, closes the broker connections and clears
    /// subscriptions and pending requests. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.initialized {
            return Ok(());
        }

        for (topic, subscription) in state.subscriptions.drain() {
            subscription.task.abort();
            if let Err(e) = self.broker.unsubscribe(&subscription.group_id, &topic).await {
                tracing::warn!(%topic, group_id = %subscription.group_id, error = %e, "failed to unsubscribe");
            }
        }
        state.known_topics.clear();
        // Dropping the resolvers wakes every waiter with `Disconnected`.
        self.pending.clear();
        state.initialized = false;

        if let Err(e) = self.broker.disconnect().await {
            tracing::warn!(error = %e, "broker disconnect failed");
        }
        tracing::info!("message bus disconnected");
        Ok(())
    }

    async fn ensure_topic(&self, state: &mut BusState, topic: &str) -> Result<()> {
        if state.known_topics.contains(topic) {
            return Ok(());
        }
        if !self.broker.topic_exists(topic).await? {
            self.broker
                .create_topic(topic, self.config.topic_config)
                .await?;
            tracing::info!(
                %topic,
                partitions = self.config.topic_config.num_partitions,
                replication = self.config.topic_config.replication_factor,
                "created topic"
            );
        }
        state.known_topics.insert(topic.to_string());
        Ok(())
    }
}

/// Delivers one subscription's records to its handler, one at a time.
///
/// Handler errors and panics are logged and the record is acknowledged as
/// processed; the loop only ends when the delivery channel closes.
async fn run_consumer(
    group_id: String,
    topic: String,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    handler: Arc<dyn MessageHandler>,
) {
    while let Some(delivery) = deliveries.recv().await {
        let record = &delivery.record;
        match serde_json::from_slice::<Value>(&record.payload) {
            Ok(payload) => {
                let message = InboundMessage {
                    topic: record.topic.clone(),
                    payload,
                    timestamp: record.timestamp,
                };
                match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        metrics::counter!("message_bus_handler_errors_total", "topic" => topic.clone())
                            .increment(1);
                        tracing::error!(%group_id, %topic, error = %e, "message handler failed");
                    }
                    Err(_) => {
                        metrics::counter!("message_bus_handler_errors_total", "topic" => topic.clone())
                            .increment(1);
                        tracing::error!(%group_id, %topic, "message handler panicked");
                    }
                }
            }
            Err(e) => {
                metrics::counter!("message_bus_invalid_messages_total").increment(1);
                tracing::warn!(%group_id, %topic, error = %e, "dropping non-JSON message");
            }
        }

        if let Err(e) = delivery.ack().await {
            tracing::warn!(%group_id, %topic, error = %e, "failed to acknowledge record");
        }
    }
    tracing::debug!(%group_id, %topic, "consumer loop stopped");
}
