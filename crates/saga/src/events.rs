//! Wire schemas for step commands and control events.
//!
//! Every message the coordinator publishes or consumes has an explicit schema
//! here. Control messages are decoded into [`ControlMessage`] once, at the bus
//! boundary; anything that does not match its topic's schema is rejected
//! there and never reaches the coordinator.

use chrono::{DateTime, Utc};
use common::TransactionId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SagaError;
use crate::state::{StepStatus, TransactionStatus};
use crate::timestamp;
use crate::transaction::Payload;

/// Topic a participant listens on to execute `step_name`.
pub fn step_topic(process_type: &str, step_name: &str) -> String {
    format!("{process_type}-step-{step_name}")
}

/// Topic a participant listens on to undo `step_name`.
pub fn compensate_topic(process_type: &str, step_name: &str) -> String {
    format!("{process_type}-compensate-{step_name}")
}

/// The fixed, process-type-independent control topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlTopic {
    StepCompleted,
    StepFailed,
    TransactionTimeout,
    CompensationStart,
    CompensationCompleted,
    TransactionCompleted,
}

impl ControlTopic {
    pub const ALL: [ControlTopic; 6] = [
        ControlTopic::StepCompleted,
        ControlTopic::StepFailed,
        ControlTopic::TransactionTimeout,
        ControlTopic::CompensationStart,
        ControlTopic::CompensationCompleted,
        ControlTopic::TransactionCompleted,
    ];

    /// Returns the topic name on the bus.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlTopic::StepCompleted => "step-completed",
            ControlTopic::StepFailed => "step-failed",
            ControlTopic::TransactionTimeout => "timeout",
            ControlTopic::CompensationStart => "compensation-start",
            ControlTopic::CompensationCompleted => "compensation-completed",
            ControlTopic::TransactionCompleted => "transaction-completed",
        }
    }
}

impl std::fmt::Display for ControlTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command published to a step topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCommand {
    pub transaction_id: TransactionId,
    pub process_type: String,
    pub step_name: String,
    #[serde(default)]
    pub payload: Payload,
}

/// Command published to a compensation topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationCommand {
    pub transaction_id: TransactionId,
    pub process_type: String,
    pub step_name: String,
    #[serde(default)]
    pub payload: Payload,
}

/// Outcome of a step, reported by its participant on `step-completed` or
/// `step-failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEvent {
    pub transaction_id: TransactionId,
    pub process_type: String,
    pub step_name: String,
    pub status: StepStatus,
    /// Step output, merged into the transaction payload on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransactionEvent {
    pub fn completed(command: &StepCommand, output: Option<Payload>) -> Self {
        Self {
            transaction_id: command.transaction_id,
            process_type: command.process_type.clone(),
            step_name: command.step_name.clone(),
            status: StepStatus::Completed,
            payload: output,
            error: None,
        }
    }

    pub fn failed(command: &StepCommand, error: impl Into<String>) -> Self {
        Self {
            transaction_id: command.transaction_id,
            process_type: command.process_type.clone(),
            step_name: command.step_name.clone(),
            status: StepStatus::Failed,
            payload: None,
            error: Some(error.into()),
        }
    }
}

/// Published on `compensation-start` and `compensation-completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationEvent {
    pub transaction_id: TransactionId,
    pub process_type: String,
    /// The step whose failure (or timeout) triggered compensation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    pub status: TransactionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Published on `timeout` by the timeout checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutEvent {
    pub transaction_id: TransactionId,
    pub process_type: String,
    pub step_name: String,
    #[serde(with = "timestamp")]
    pub started_at: DateTime<Utc>,
}

/// Published on `transaction-completed` once every step has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionCompletedEvent {
    pub transaction_id: TransactionId,
    pub process_type: String,
    pub status: TransactionStatus,
    #[serde(with = "timestamp")]
    pub completed_at: DateTime<Utc>,
}

/// A decoded control message, one variant per control topic.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    StepCompleted(TransactionEvent),
    StepFailed(TransactionEvent),
    Timeout(TimeoutEvent),
    CompensationStart(CompensationEvent),
    CompensationCompleted(CompensationEvent),
    TransactionCompleted(TransactionCompletedEvent),
}

impl ControlMessage {
    /// Decodes `payload` against the schema of `topic`.
    ///
    /// Step events must carry the status matching their topic.
    pub fn decode(topic: ControlTopic, payload: Value) -> Result<Self, SagaError> {
        let message = match topic {
            ControlTopic::StepCompleted => {
                let event: TransactionEvent = parse(topic, payload)?;
                expect_status(topic, &event, StepStatus::Completed)?;
                ControlMessage::StepCompleted(event)
            }
            ControlTopic::StepFailed => {
                let event: TransactionEvent = parse(topic, payload)?;
                expect_status(topic, &event, StepStatus::Failed)?;
                ControlMessage::StepFailed(event)
            }
            ControlTopic::TransactionTimeout => ControlMessage::Timeout(parse(topic, payload)?),
            ControlTopic::CompensationStart => {
                ControlMessage::CompensationStart(parse(topic, payload)?)
            }
            ControlTopic::CompensationCompleted => {
                ControlMessage::CompensationCompleted(parse(topic, payload)?)
            }
            ControlTopic::TransactionCompleted => {
                ControlMessage::TransactionCompleted(parse(topic, payload)?)
            }
        };
        Ok(message)
    }

    /// The transaction the message refers to.
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            ControlMessage::StepCompleted(e) | ControlMessage::StepFailed(e) => e.transaction_id,
            ControlMessage::Timeout(e) => e.transaction_id,
            ControlMessage::CompensationStart(e) | ControlMessage::CompensationCompleted(e) => {
                e.transaction_id
            }
            ControlMessage::TransactionCompleted(e) => e.transaction_id,
        }
    }
}

fn parse<T: DeserializeOwned>(topic: ControlTopic, payload: Value) -> Result<T, SagaError> {
    serde_json::from_value(payload).map_err(|e| SagaError::InvalidMessage {
        topic: topic.to_string(),
        reason: e.to_string(),
    })
}

fn expect_status(
    topic: ControlTopic,
    event: &TransactionEvent,
    expected: StepStatus,
) -> Result<(), SagaError> {
    if event.status == expected {
        return Ok(());
    }
    Err(SagaError::InvalidMessage {
        topic: topic.to_string(),
        reason: format!("expected status {expected}, got {}", event.status),
    })
}
