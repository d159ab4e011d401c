use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    MessageBusError, Result,
    broker::{Broker, Delivery, Record, RecordSink, TopicConfig},
};

struct TopicState {
    config: TopicConfig,
    groups: HashMap<String, RecordSink>,
}

#[derive(Default)]
struct BrokerState {
    connected: bool,
    topics: HashMap<String, TopicState>,
    history: Vec<Record>,
}

/// In-memory broker for tests and single-process deployments.
///
/// Topics and the send history survive `disconnect`; group memberships do not.
/// Every sent record is kept in an append-only history for inspection.
/// Nothing is retained for a group while it is unsubscribed.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<RwLock<BrokerState>>,
}

impl InMemoryBroker {
    /// Creates a new broker with no topics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while connected.
    pub async fn is_connected(&self) -> bool {
        self.state.read().await.connected
    }

    /// Returns all topic names, sorted.
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.read().await.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Returns the configuration a topic was created with.
    pub async fn topic_config(&self, topic: &str) -> Option<TopicConfig> {
        self.state.read().await.topics.get(topic).map(|t| t.config)
    }

    /// Returns every record sent so far, oldest first.
    pub async fn history(&self) -> Vec<Record> {
        self.state.read().await.history.clone()
    }

    /// Returns the JSON bodies of records sent to `topic`, oldest first.
    ///
    /// Records that are not valid JSON are skipped.
    pub async fn sent_json(&self, topic: &str) -> Vec<serde_json::Value> {
        self.state
            .read()
            .await
            .history
            .iter()
            .filter(|r| r.topic == topic)
            .filter_map(|r| serde_json::from_slice(&r.payload).ok())
            .collect()
    }

    /// Returns the number of groups subscribed to `topic`.
    pub async fn group_count(&self, topic: &str) -> usize {
        self.state
            .read()
            .await
            .topics
            .get(topic)
            .map_or(0, |t| t.groups.len())
    }
}

fn ensure_connected(state: &BrokerState) -> Result<()> {
    if state.connected {
        Ok(())
    } else {
        Err(MessageBusError::Transport(
            "broker connection is closed".to_string(),
        ))
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<()> {
        self.state.write().await.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.connected = false;
        for topic in state.topics.values_mut() {
            topic.groups.clear();
        }
        Ok(())
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        let state = self.state.read().await;
        ensure_connected(&state)?;
        Ok(state.topics.contains_key(topic))
    }

    async fn create_topic(&self, topic: &str, config: TopicConfig) -> Result<()> {
        let mut state = self.state.write().await;
        ensure_connected(&state)?;
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState {
                config,
                groups: HashMap::new(),
            });
        Ok(())
    }

    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut state = self.state.write().await;
        ensure_connected(&state)?;

        let record = Record {
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now(),
        };

        let topic_state = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| MessageBusError::UnknownTopic(topic.to_string()))?;

        // A closed sink means the consuming side went away; drop the membership.
        topic_state
            .groups
            .retain(|_, sink| sink.send(Delivery::new(record.clone())).is_ok());

        state.history.push(record);
        Ok(())
    }

    async fn subscribe(&self, group_id: &str, topic: &str, sink: RecordSink) -> Result<()> {
        let mut state = self.state.write().await;
        ensure_connected(&state)?;
        let topic_state = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| MessageBusError::UnknownTopic(topic.to_string()))?;
        topic_state.groups.insert(group_id.to_string(), sink);
        Ok(())
    }

    async fn unsubscribe(&self, group_id: &str, topic: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(topic_state) = state.topics.get_mut(topic) {
            topic_state.groups.remove(group_id);
        }
        Ok(())
    }
}
