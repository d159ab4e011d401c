//! The distributed transaction model.

use chrono::{DateTime, Utc};
use common::TransactionId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SagaError;
use crate::state::{StepStatus, TransactionStatus};
use crate::timestamp;

/// Opaque key/value payload handed to every step.
pub type Payload = Map<String, Value>;

/// A step as requested by the caller: which named step, run by which service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub service: String,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
        }
    }
}

/// Request to start a new distributed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransaction {
    pub process_type: String,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub payload: Payload,
    pub initiated_by: String,
}

impl StartTransaction {
    pub fn new(
        process_type: impl Into<String>,
        steps: Vec<StepDefinition>,
        payload: Payload,
        initiated_by: impl Into<String>,
    ) -> Self {
        Self {
            process_type: process_type.into(),
            steps,
            payload,
            initiated_by: initiated_by.into(),
        }
    }

    /// Rejects requests whose names would produce unusable topic names.
    pub fn validate(&self) -> Result<(), SagaError> {
        if self.process_type.trim().is_empty() {
            return Err(SagaError::InvalidRequest(
                "process type must not be empty".to_string(),
            ));
        }
        if let Some(step) = self
            .steps
            .iter()
            .find(|s| s.name.trim().is_empty() || s.service.trim().is_empty())
        {
            return Err(SagaError::InvalidRequest(format!(
                "step name and service must not be empty (got {:?} / {:?})",
                step.name, step.service
            )));
        }
        Ok(())
    }
}

/// One step of a transaction, owned by the transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStep {
    pub name: String,
    pub service: String,
    pub status: StepStatus,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<StepDefinition> for ProcessStep {
    fn from(definition: StepDefinition) -> Self {
        Self {
            name: definition.name,
            service: definition.service,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// A multi-step business transaction coordinated as a saga.
///
/// The step list is fixed at creation. `current_step` only moves forward and
/// indexes the single active step; it equals `steps.len()` once every step
/// has completed. Mutators are crate-private so every change goes through the
/// coordinator, which persists it before publishing anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedTransaction {
    transaction_id: TransactionId,
    process_type: String,
    initiated_by: String,
    payload: Payload,
    #[serde(with = "timestamp")]
    started_at: DateTime<Utc>,
    current_step: usize,
    steps: Vec<ProcessStep>,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    completed_at: Option<DateTime<Utc>>,
    status: TransactionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl DistributedTransaction {
    /// Builds a new transaction with a fresh ID and every step pending.
    pub fn new(request: StartTransaction, started_at: DateTime<Utc>) -> Self {
        Self {
            transaction_id: TransactionId::new(),
            process_type: request.process_type,
            initiated_by: request.initiated_by,
            payload: request.payload,
            started_at,
            current_step: 0,
            steps: request.steps.into_iter().map(ProcessStep::from).collect(),
            completed_at: None,
            status: TransactionStatus::Started,
            error: None,
        }
    }

    /// Minimal record written when an event arrives for a transaction this
    /// process has no state for (expired or never seen).
    pub(crate) fn placeholder(
        transaction_id: TransactionId,
        process_type: impl Into<String>,
        status: TransactionStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id,
            process_type: process_type.into(),
            initiated_by: "system".to_string(),
            payload: Payload::new(),
            started_at: now,
            current_step: 0,
            steps: Vec::new(),
            completed_at: status.is_terminal().then_some(now),
            status,
            error,
        }
    }

    /// Decodes a persisted transaction, rejecting anything incomplete or
    /// inconsistent.
    pub fn from_json(raw: &str) -> Result<Self, SagaError> {
        let transaction: Self =
            serde_json::from_str(raw).map_err(|e| SagaError::CorruptState(e.to_string()))?;
        if transaction.current_step > transaction.steps.len() {
            return Err(SagaError::CorruptState(format!(
                "current step {} out of range for {} steps",
                transaction.current_step,
                transaction.steps.len()
            )));
        }
        Ok(transaction)
    }

    /// Encodes the transaction in its persisted form.
    pub fn to_json(&self) -> Result<String, SagaError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn process_type(&self) -> &str {
        &self.process_type
    }

    pub fn initiated_by(&self) -> &str {
        &self.initiated_by
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn steps(&self) -> &[ProcessStep] {
        &self.steps
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Returns the active step, or `None` once every step has completed.
    pub fn active_step(&self) -> Option<&ProcessStep> {
        self.steps.get(self.current_step)
    }

    /// Returns true when `current_step` has run past the last step.
    pub fn all_steps_completed(&self) -> bool {
        self.current_step >= self.steps.len()
    }

    /// Returns true if `step_name` names the active step.
    pub fn is_active_step(&self, step_name: &str) -> bool {
        self.active_step().is_some_and(|s| s.name == step_name)
    }

    pub(crate) fn start_active_step(&mut self, now: DateTime<Utc>) {
        if let Some(step) = self.steps.get_mut(self.current_step) {
            step.started_at = Some(now);
        }
        self.status = TransactionStatus::InProgress;
    }

    /// Completes the active step, folds its output into the payload and
    /// advances `current_step`.
    pub(crate) fn complete_active_step(&mut self, now: DateTime<Utc>, output: Option<Payload>) {
        let Some(step) = self.steps.get_mut(self.current_step) else {
            return;
        };
        step.status = StepStatus::Completed;
        step.completed_at = Some(now);
        if let Some(output) = output {
            self.payload.extend(output);
        }
        self.current_step += 1;
    }

    pub(crate) fn fail_active_step(&mut self, error: impl Into<String>) {
        let error = error.into();
        if let Some(step) = self.steps.get_mut(self.current_step) {
            step.status = StepStatus::Failed;
            step.error = Some(error.clone());
        }
        self.status = TransactionStatus::Failed;
        self.error = Some(error);
    }

    pub(crate) fn mark_timed_out(&mut self, error: impl Into<String>) {
        self.status = TransactionStatus::TimedOut;
        self.error = Some(error.into());
    }

    pub(crate) fn begin_compensation(&mut self) {
        self.status = TransactionStatus::Compensating;
    }

    /// Indices of the steps to compensate: completed steps before
    /// `current_step`, latest first.
    pub(crate) fn compensation_plan(&self) -> Vec<usize> {
        (0..self.current_step.min(self.steps.len()))
            .rev()
            .filter(|&i| self.steps[i].status == StepStatus::Completed)
            .collect()
    }

    pub(crate) fn mark_step_compensated(&mut self, index: usize) {
        if let Some(step) = self.steps.get_mut(index) {
            step.status = StepStatus::Compensated;
        }
    }

    pub(crate) fn finish_compensation(&mut self, now: DateTime<Utc>) {
        self.status = TransactionStatus::Compensated;
        self.completed_at.get_or_insert(now);
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) {
        self.status = TransactionStatus::Completed;
        self.completed_at.get_or_insert(now);
    }
}
