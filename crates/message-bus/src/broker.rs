//! Broker transport abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::Result;

/// Partition and replication policy applied to auto-created topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicConfig {
    pub num_partitions: u32,
    pub replication_factor: u16,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            num_partitions: 1,
            replication_factor: 1,
        }
    }
}

/// A raw record as delivered by the broker.
#[derive(Debug, Clone)]
pub struct Record {
    /// The topic the record was sent to.
    pub topic: String,
    /// Serialized message body.
    pub payload: Vec<u8>,
    /// When the broker accepted the record.
    pub timestamp: DateTime<Utc>,
}

/// Confirms to the broker that a delivered record was processed.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// A record handed to a consumer, together with its acknowledgement.
///
/// Brokers without redelivery send records with no acknowledger. A durable
/// broker redelivers a record whose delivery is dropped without `ack`.
pub struct Delivery {
    pub record: Record,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    pub fn new(record: Record) -> Self {
        Self {
            record,
            acker: None,
        }
    }

    pub fn with_acker(mut self, acker: Box<dyn Acknowledger>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Acknowledges the record, consuming the delivery.
    pub async fn ack(self) -> Result<()> {
        match self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("record", &self.record)
            .field("acked_by_broker", &self.acker.is_some())
            .finish()
    }
}

/// Channel a single (group, topic) subscription receives its records on.
pub type RecordSink = mpsc::UnboundedSender<Delivery>;

/// A topic-based publish/subscribe broker.
///
/// Delivery semantics expected by the bus:
/// - every record sent to a topic reaches each subscribed consumer group once
/// - records reach a given group in the order they were sent
/// - groups never steal records from one another
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens the producer, consumer and admin connections.
    async fn connect(&self) -> Result<()>;

    /// Closes all connections and stops every subscription.
    async fn disconnect(&self) -> Result<()>;

    /// Returns true if the topic exists.
    async fn topic_exists(&self, topic: &str) -> Result<bool>;

    /// Creates a topic. Creating an existing topic is not an error.
    async fn create_topic(&self, topic: &str, config: TopicConfig) -> Result<()>;

    /// Sends a record to an existing topic.
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Joins `group_id` to `topic`, delivering its records into `sink`.
    async fn subscribe(&self, group_id: &str, topic: &str, sink: RecordSink) -> Result<()>;

    /// Stops delivering `topic` to `group_id`.
    ///
    /// A durable broker keeps the group's position so unacknowledged and
    /// later records are delivered when the group subscribes again.
    async fn unsubscribe(&self, group_id: &str, topic: &str) -> Result<()>;
}
