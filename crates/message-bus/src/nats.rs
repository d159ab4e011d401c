//! NATS JetStream broker.
//!
//! Each topic is backed by its own stream capturing the subject
//! `{subject_prefix}.{topic}`, and each consumer group by a durable pull
//! consumer on that stream. Records are acknowledged explicitly once the
//! bus has handled them; anything left unacknowledged (a crash, an
//! unsubscribe mid-handler) is redelivered after `ack_wait`.
//!
//! A group's durable consumer starts at the records published after it was
//! first created and keeps its position across restarts and unsubscribes.

use std::collections::HashMap;
use std::time::Duration;

use async_nats::jetstream::consumer::pull::{
    Config as PullConsumerConfig, Stream as PullStream,
};
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy, PullConsumer};
use async_nats::jetstream::stream::{
    Config as StreamConfig, DiscardPolicy, RetentionPolicy, StorageType,
};
use async_nats::jetstream::{self, Context as JetStreamContext};
use async_nats::{Client, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::broker::{Acknowledger, Broker, Delivery, Record, RecordSink, TopicConfig};
use crate::{MessageBusError, Result};

/// Header carrying the RFC 3339 time the record was sent.
pub const PUBLISHED_AT_HEADER: &str = "Published-At";

/// Connection and stream settings for [`NatsBroker`].
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// Server URL, e.g. `nats://localhost:4222`.
    pub url: String,
    /// Client connection name reported to the server.
    pub name: Option<String>,
    pub connection_timeout: Duration,
    /// Prefix of stream names (`{prefix}_{topic}`).
    pub stream_prefix: String,
    /// Prefix of subjects (`{prefix}.{topic}`).
    pub subject_prefix: String,
    /// How long a stream retains records.
    pub max_age: Duration,
    /// Redelivery delay for unacknowledged records.
    pub ack_wait: Duration,
    /// Delivery attempts per record before the server gives up on it.
    pub max_deliver: i64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            name: Some("saga-coordinator".to_string()),
            connection_timeout: Duration::from_secs(5),
            stream_prefix: "SAGA".to_string(),
            subject_prefix: "saga".to_string(),
            max_age: Duration::from_secs(24 * 60 * 60),
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
        }
    }
}

impl NatsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    fn stream_name(&self, topic: &str) -> String {
        format!("{}_{}", self.stream_prefix, sanitize_name(topic))
    }

    fn subject(&self, topic: &str) -> String {
        format!("{}.{}", self.subject_prefix, sanitize_subject(topic))
    }
}

/// Stream and durable consumer names may only contain `[A-Za-z0-9_-]`.
fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Subject tokens must not contain whitespace or wildcards.
fn sanitize_subject(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_whitespace() || c == '*' || c == '>' {
                '_'
            } else {
                c
            }
        })
        .collect()
}

fn transport(e: impl std::fmt::Display) -> MessageBusError {
    MessageBusError::Transport(e.to_string())
}

fn published_at(headers: Option<&HeaderMap>) -> DateTime<Utc> {
    headers
        .and_then(|h| h.get(PUBLISHED_AT_HEADER))
        .and_then(|v| DateTime::parse_from_rfc3339(v.as_str()).ok())
        .map_or_else(Utc::now, |t| t.with_timezone(&Utc))
}

#[derive(Clone)]
struct Connection {
    client: Client,
    jetstream: JetStreamContext,
}

struct JetStreamAck(jetstream::Message);

#[async_trait]
impl Acknowledger for JetStreamAck {
    async fn ack(&self) -> Result<()> {
        self.0.ack().await.map_err(transport)
    }
}

/// Durable broker over NATS JetStream, shared by independently deployed
/// coordinator and participant processes.
pub struct NatsBroker {
    config: NatsConfig,
    connection: RwLock<Option<Connection>>,
    /// (group, topic) -> task pulling from the group's durable consumer.
    consumers: Mutex<HashMap<(String, String), JoinHandle<()>>>,
}

impl NatsBroker {
    pub fn new(config: NatsConfig) -> Self {
        Self {
            config,
            connection: RwLock::new(None),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    async fn jetstream(&self) -> Result<JetStreamContext> {
        self.connection
            .read()
            .await
            .as_ref()
            .map(|c| c.jetstream.clone())
            .ok_or_else(|| MessageBusError::Transport("not connected to NATS".to_string()))
    }

    async fn durable_consumer(&self, group_id: &str, topic: &str) -> Result<PullConsumer> {
        let jetstream = self.jetstream().await?;
        let stream = jetstream
            .get_stream(self.config.stream_name(topic))
            .await
            .map_err(|_| MessageBusError::UnknownTopic(topic.to_string()))?;

        let durable = sanitize_name(group_id);
        stream
            .get_or_create_consumer(
                &durable,
                PullConsumerConfig {
                    durable_name: Some(durable.clone()),
                    deliver_policy: DeliverPolicy::New,
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait,
                    max_deliver: self.config.max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(transport)
    }
}

#[async_trait]
impl Broker for NatsBroker {
    #[tracing::instrument(skip(self), fields(url = %self.config.url))]
    async fn connect(&self) -> Result<()> {
        let mut connection = self.connection.write().await;
        if connection.is_some() {
            return Ok(());
        }

        let mut options =
            ConnectOptions::new().connection_timeout(self.config.connection_timeout);
        if let Some(name) = &self.config.name {
            options = options.name(name);
        }
        let client = async_nats::connect_with_options(self.config.url.as_str(), options)
            .await
            .map_err(transport)?;
        let jetstream = jetstream::new(client.clone());

        *connection = Some(Connection { client, jetstream });
        tracing::info!("connected to NATS");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        for (_, task) in self.consumers.lock().await.drain() {
            task.abort();
        }
        if let Some(connection) = self.connection.write().await.take() {
            if let Err(e) = connection.client.flush().await {
                tracing::warn!(error = %e, "failed to flush NATS connection");
            }
            tracing::info!("disconnected from NATS");
        }
        Ok(())
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        let jetstream = self.jetstream().await?;
        match jetstream.get_stream(self.config.stream_name(topic)).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::debug!(%topic, error = %e, "stream lookup failed");
                Ok(false)
            }
        }
    }

    async fn create_topic(&self, topic: &str, config: TopicConfig) -> Result<()> {
        if config.num_partitions > 1 {
            tracing::debug!(
                %topic,
                partitions = config.num_partitions,
                "JetStream streams are not partitioned; ordering is per stream"
            );
        }

        let jetstream = self.jetstream().await?;
        jetstream
            .get_or_create_stream(StreamConfig {
                name: self.config.stream_name(topic),
                subjects: vec![self.config.subject(topic)],
                retention: RetentionPolicy::Limits,
                max_age: self.config.max_age,
                storage: StorageType::File,
                num_replicas: usize::from(config.replication_factor.max(1)),
                discard: DiscardPolicy::Old,
                ..Default::default()
            })
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let jetstream = self.jetstream().await?;
        let mut headers = HeaderMap::new();
        headers.insert(PUBLISHED_AT_HEADER, Utc::now().to_rfc3339().as_str());

        // Waiting for the ack confirms the record was stored.
        jetstream
            .publish_with_headers(self.config.subject(topic), headers, payload.into())
            .await
            .map_err(transport)?
            .await
            .map_err(transport)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, sink))]
    async fn subscribe(&self, group_id: &str, topic: &str, sink: RecordSink) -> Result<()> {
        let consumer = self.durable_consumer(group_id, topic).await?;
        let messages = consumer.messages().await.map_err(transport)?;

        let task = tokio::spawn(forward_messages(
            group_id.to_string(),
            topic.to_string(),
            messages,
            sink,
        ));
        if let Some(previous) = self
            .consumers
            .lock()
            .await
            .insert((group_id.to_string(), topic.to_string()), task)
        {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, group_id: &str, topic: &str) -> Result<()> {
        if let Some(task) = self
            .consumers
            .lock()
            .await
            .remove(&(group_id.to_string(), topic.to_string()))
        {
            task.abort();
        }
        Ok(())
    }
}

/// Pulls a durable consumer's messages into the subscription's sink.
async fn forward_messages(
    group_id: String,
    topic: String,
    mut messages: PullStream,
    sink: RecordSink,
) {
    while let Some(next) = messages.next().await {
        match next {
            Ok(message) => {
                let record = Record {
                    topic: topic.clone(),
                    payload: message.payload.to_vec(),
                    timestamp: published_at(message.headers.as_ref()),
                };
                let delivery = Delivery::new(record).with_acker(Box::new(JetStreamAck(message)));
                if sink.send(delivery).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(%group_id, %topic, error = %e, "failed to pull from JetStream");
            }
        }
    }
    tracing::debug!(%group_id, %topic, "JetStream pull loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NatsConfig::default();
        assert_eq!(config.url, "nats://localhost:4222");
        assert_eq!(config.max_age, Duration::from_secs(86_400));
        assert_eq!(config.max_deliver, 5);
    }

    #[test]
    fn test_stream_and_subject_names() {
        let config = NatsConfig::new("nats://nats:4222");
        assert_eq!(
            config.stream_name("ORDER_APPROVAL-step-update-status"),
            "SAGA_ORDER_APPROVAL-step-update-status"
        );
        assert_eq!(config.stream_name("a.b c"), "SAGA_a_b_c");
        assert_eq!(config.subject("step-completed"), "saga.step-completed");
        assert_eq!(config.subject("a.b *"), "saga.a.b__");
    }

    #[test]
    fn test_durable_names_are_sanitized() {
        assert_eq!(sanitize_name("saga-coordinator"), "saga-coordinator");
        assert_eq!(sanitize_name("group.one"), "group_one");
    }

    #[test]
    fn test_published_at_header() {
        let mut headers = HeaderMap::new();
        headers.insert(PUBLISHED_AT_HEADER, "2024-05-01T10:00:00.123Z");
        let parsed = published_at(Some(&headers));
        assert_eq!(parsed.to_rfc3339(), "2024-05-01T10:00:00.123+00:00");

        let before = Utc::now();
        assert!(published_at(None) >= before);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let broker = NatsBroker::new(NatsConfig::default());
        assert!(matches!(
            broker.send("orders", b"{}".to_vec()).await,
            Err(MessageBusError::Transport(_))
        ));
        assert!(broker.disconnect().await.is_ok());
    }
}
