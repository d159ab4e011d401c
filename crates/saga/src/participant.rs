//! Helpers for services that execute saga steps.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use message_bus::{HandlerResult, InboundMessage, MessageBus, MessageHandler};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::events::{
    CompensationCommand, ControlTopic, StepCommand, TransactionEvent, compensate_topic, step_topic,
};
use crate::transaction::Payload;

/// Outcome of executing a step: optional output merged into the transaction
/// payload, or an error message reported as a step failure.
pub type StepOutcome = std::result::Result<Option<Payload>, String>;

/// The local work behind one saga step.
///
/// Commands may be delivered more than once, so implementations must be
/// idempotent.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Performs the step.
    async fn execute(&self, command: &StepCommand) -> StepOutcome;

    /// Undoes a previously completed step.
    async fn compensate(&self, command: &CompensationCommand) -> std::result::Result<(), String>;
}

/// Connects step executors to the bus.
///
/// For each registered step, the participant consumes the step topic, runs
/// the executor and publishes `step-completed` or `step-failed`. It also
/// consumes the compensation topic; compensation is not acknowledged.
pub struct StepParticipant {
    bus: Arc<MessageBus>,
    group_id: String,
}

impl StepParticipant {
    pub fn new(bus: Arc<MessageBus>, group_id: impl Into<String>) -> Self {
        Self {
            bus,
            group_id: group_id.into(),
        }
    }

    /// Subscribes `executor` to the step and compensation topics of
    /// `step_name` in `process_type`.
    #[tracing::instrument(skip(self, executor), fields(group_id = %self.group_id))]
    pub async fn register(
        &self,
        process_type: &str,
        step_name: &str,
        executor: Arc<dyn StepExecutor>,
    ) -> Result<()> {
        self.bus
            .subscribe(
                &step_topic(process_type, step_name),
                Arc::new(StepHandler {
                    bus: Arc::downgrade(&self.bus),
                    executor: executor.clone(),
                }),
                Some(&self.group_id),
            )
            .await?;
        self.bus
            .subscribe(
                &compensate_topic(process_type, step_name),
                Arc::new(CompensationHandler { executor }),
                Some(&self.group_id),
            )
            .await?;
        tracing::info!("step participant registered");
        Ok(())
    }
}

struct StepHandler {
    // Weak: the bus owns this handler.
    bus: Weak<MessageBus>,
    executor: Arc<dyn StepExecutor>,
}

#[async_trait]
impl MessageHandler for StepHandler {
    async fn handle(&self, message: InboundMessage) -> HandlerResult {
        let command: StepCommand = message.decode()?;
        let Some(bus) = self.bus.upgrade() else {
            return Ok(());
        };

        let (topic, event) = match self.executor.execute(&command).await {
            Ok(output) => (
                ControlTopic::StepCompleted,
                TransactionEvent::completed(&command, output),
            ),
            Err(error) => {
                tracing::warn!(
                    transaction_id = %command.transaction_id,
                    step = %command.step_name,
                    %error,
                    "step execution failed"
                );
                (
                    ControlTopic::StepFailed,
                    TransactionEvent::failed(&command, error),
                )
            }
        };
        bus.publish(topic.as_str(), &event).await?;
        Ok(())
    }
}

struct CompensationHandler {
    executor: Arc<dyn StepExecutor>,
}

#[async_trait]
impl MessageHandler for CompensationHandler {
    async fn handle(&self, message: InboundMessage) -> HandlerResult {
        let command: CompensationCommand = message.decode()?;
        self.executor.compensate(&command).await?;
        tracing::debug!(
            transaction_id = %command.transaction_id,
            step = %command.step_name,
            "step compensated"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InMemoryExecutorState {
    executions: Vec<StepCommand>,
    compensations: Vec<CompensationCommand>,
    failure: Option<String>,
    output: Option<Payload>,
}

/// Scriptable executor for tests and demos.
///
/// Records every command it receives. Succeeds with the configured output
/// unless a failure has been set.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStepExecutor {
    state: Arc<RwLock<InMemoryExecutorState>>,
}

impl InMemoryStepExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output returned by every successful execution.
    pub async fn set_output(&self, output: Payload) {
        self.state.write().await.output = Some(output);
    }

    /// Makes every execution fail with `error` (or succeed again with `None`).
    pub async fn set_failure(&self, error: Option<&str>) {
        self.state.write().await.failure = error.map(str::to_string);
    }

    pub async fn executions(&self) -> Vec<StepCommand> {
        self.state.read().await.executions.clone()
    }

    pub async fn compensations(&self) -> Vec<CompensationCommand> {
        self.state.read().await.compensations.clone()
    }
}

#[async_trait]
impl StepExecutor for InMemoryStepExecutor {
    async fn execute(&self, command: &StepCommand) -> StepOutcome {
        let mut state = self.state.write().await;
        state.executions.push(command.clone());
        match &state.failure {
            Some(error) => Err(error.clone()),
            None => Ok(state.output.clone()),
        }
    }

    async fn compensate(&self, command: &CompensationCommand) -> std::result::Result<(), String> {
        self.state.write().await.compensations.push(command.clone());
        Ok(())
    }
}
