//! Saga coordinator for distributed transactions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use common::TransactionId;
use message_bus::{HandlerResult, InboundMessage, MessageBus, MessageHandler};
use state_store::StateStore;
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::config::SagaConfig;
use crate::error::{Result, SagaError};
use crate::events::{
    CompensationCommand, CompensationEvent, ControlMessage, ControlTopic, StepCommand,
    TimeoutEvent, TransactionCompletedEvent, TransactionEvent, compensate_topic, step_topic,
};
use crate::lock::TransactionLocks;
use crate::repository::TransactionRepository;
use crate::state::TransactionStatus;
use crate::timeout::TimeoutChecker;
use crate::timestamp::{self, Clock};
use crate::transaction::{DistributedTransaction, StartTransaction};

/// Error recorded on a transaction whose active step ran too long.
pub const TIMEOUT_ERROR: &str = "Transaction timed out";

/// Error recorded when a step-failed event carries no error text.
pub const DEFAULT_STEP_ERROR: &str = "Step failed";

fn record_dropped(reason: &'static str) {
    metrics::counter!("saga_events_dropped_total", "reason" => reason).increment(1);
}

/// Orchestrates distributed transactions as sagas.
///
/// The coordinator publishes one step command at a time and advances when the
/// participant reports back on the control topics. A failed or timed-out step
/// triggers compensation of the completed steps in reverse order.
///
/// Every state change is written to the state store before anything is
/// published. Handlers tolerate duplicate and out-of-order delivery through
/// status and step-name guards; a per-transaction mutex additionally
/// serializes handlers within this process.
///
/// Timestamps come from a [`Clock`] driven by tokio time, so step timeouts
/// and the checker's interval share one time source.
///
/// Lifecycle: wrap in an `Arc`, call [`initialize`](Self::initialize) once,
/// and [`disconnect`](Self::disconnect) on shutdown.
pub struct SagaCoordinator<S: StateStore + 'static> {
    bus: Arc<MessageBus>,
    repository: TransactionRepository<S>,
    config: SagaConfig,
    clock: Clock,
    initialized: AtomicBool,
    checker: Mutex<Option<TimeoutChecker>>,
    locks: TransactionLocks,
}

impl<S: StateStore + 'static> SagaCoordinator<S> {
    /// Creates a coordinator. Nothing is subscribed until `initialize`.
    pub fn new(bus: Arc<MessageBus>, store: S, config: SagaConfig) -> Self {
        let repository =
            TransactionRepository::new(store, config.key_prefix.clone(), config.transaction_ttl);
        Self {
            bus,
            repository,
            config,
            clock: Clock::new(),
            initialized: AtomicBool::new(false),
            checker: Mutex::new(None),
            locks: TransactionLocks::default(),
        }
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn repository(&self) -> &TransactionRepository<S> {
        &self.repository
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Subscribes to the control topics and starts the timeout checker.
    ///
    /// Idempotent while initialized.
    #[tracing::instrument(skip(self), fields(group_id = %self.config.group_id))]
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let mut checker = self.checker.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        self.bus.initialize().await?;
        for topic in ControlTopic::ALL {
            let handler = Arc::new(ControlHandler {
                coordinator: Arc::downgrade(self),
                topic,
            });
            self.bus
                .subscribe(topic.as_str(), handler, Some(&self.config.group_id))
                .await?;
        }

        *checker = Some(TimeoutChecker::spawn(
            Arc::downgrade(self),
            self.config.timeout_check_interval,
        ));
        self.initialized.store(true, Ordering::Release);
        tracing::info!("saga coordinator initialized");
        Ok(())
    }

    /// Stops the timeout checker, leaves the control topics and marks the
    /// coordinator uninitialized.
    ///
    /// Control messages sent while disconnected stay with the broker for the
    /// consumer group. Persisted transactions are left untouched.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        let mut checker = self.checker.lock().await;
        if let Some(checker) = checker.take() {
            checker.stop();
        }
        for topic in ControlTopic::ALL {
            if let Err(e) = self.bus.unsubscribe(topic.as_str()).await {
                tracing::warn!(%topic, error = %e, "failed to leave control topic");
            }
        }
        if self.initialized.swap(false, Ordering::AcqRel) {
            tracing::info!("saga coordinator disconnected");
        }
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(SagaError::NotInitialized)
        }
    }

    /// Starts a new transaction and dispatches its first step.
    ///
    /// Returns as soon as the first step command is published; the caller
    /// does not wait for the saga to finish.
    #[tracing::instrument(skip(self, request), fields(process_type = %request.process_type))]
    pub async fn start_transaction(&self, request: StartTransaction) -> Result<TransactionId> {
        self.ensure_initialized()?;
        request.validate()?;

        let transaction = DistributedTransaction::new(request, self.clock.now());
        let transaction_id = transaction.transaction_id();
        let _guard = self.locks.acquire(transaction_id).await;

        self.repository.save(&transaction).await?;
        metrics::counter!("saga_transactions_started_total").increment(1);
        tracing::info!(
            %transaction_id,
            steps = transaction.steps().len(),
            initiated_by = %transaction.initiated_by(),
            "transaction started"
        );

        self.progress_transaction(transaction_id).await?;
        Ok(transaction_id)
    }

    /// Returns the persisted state of a transaction.
    pub async fn get_transaction_state(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<DistributedTransaction>> {
        self.repository.load(transaction_id).await
    }

    /// Routes a decoded control message to its handler.
    pub async fn dispatch(&self, message: ControlMessage) -> Result<()> {
        match message {
            ControlMessage::StepCompleted(event) => self.handle_step_completed(event).await,
            ControlMessage::StepFailed(event) => self.handle_step_failed(event).await,
            ControlMessage::Timeout(event) => self.handle_transaction_timeout(event).await,
            ControlMessage::CompensationStart(event) => {
                self.handle_compensation_start(event).await
            }
            ControlMessage::CompensationCompleted(event) => {
                self.handle_compensation_completed(event).await
            }
            ControlMessage::TransactionCompleted(event) => {
                self.handle_transaction_completed(event).await
            }
        }
    }

    /// Completes the transaction or dispatches its active step.
    ///
    /// Callers hold the transaction's lock.
    async fn progress_transaction(&self, transaction_id: TransactionId) -> Result<()> {
        let Some(mut transaction) = self.repository.load(transaction_id).await? else {
            tracing::warn!(%transaction_id, "cannot progress unknown transaction");
            return Ok(());
        };
        if !transaction.status().can_progress() {
            tracing::debug!(
                %transaction_id,
                status = %transaction.status(),
                "transaction is not progressable"
            );
            return Ok(());
        }

        let now = self.clock.now();
        let Some(step_name) = transaction.active_step().map(|s| s.name.clone()) else {
            transaction.complete(now);
            self.repository.save(&transaction).await?;
            metrics::counter!("saga_transactions_completed_total").increment(1);
            tracing::info!(%transaction_id, "transaction completed");

            let event = TransactionCompletedEvent {
                transaction_id,
                process_type: transaction.process_type().to_string(),
                status: transaction.status(),
                completed_at: transaction.completed_at().unwrap_or(now),
            };
            self.bus
                .publish(ControlTopic::TransactionCompleted.as_str(), &event)
                .await?;
            return Ok(());
        };

        transaction.start_active_step(now);
        self.repository.save(&transaction).await?;

        let topic = step_topic(transaction.process_type(), &step_name);
        let command = StepCommand {
            transaction_id,
            process_type: transaction.process_type().to_string(),
            step_name,
            payload: transaction.payload().clone(),
        };
        self.bus.publish(&topic, &command).await?;
        tracing::debug!(
            %transaction_id,
            %topic,
            current_step = transaction.current_step(),
            "step command published"
        );
        Ok(())
    }

    /// Advances a transaction past its active step.
    ///
    /// Events for unknown transactions, for transactions that are no longer
    /// in progress, or for any step other than the active one are dropped.
    #[tracing::instrument(
        skip(self, event),
        fields(transaction_id = %event.transaction_id, step = %event.step_name)
    )]
    pub async fn handle_step_completed(&self, event: TransactionEvent) -> Result<()> {
        let transaction_id = event.transaction_id;
        let _guard = self.locks.acquire(transaction_id).await;

        let Some(mut transaction) = self.repository.load(transaction_id).await? else {
            tracing::warn!("step completed for unknown transaction, dropping");
            record_dropped("missing_transaction");
            return Ok(());
        };
        if !transaction.status().can_progress() {
            tracing::warn!(status = %transaction.status(), "step completed for inactive transaction, dropping");
            record_dropped("not_in_progress");
            return Ok(());
        }
        if !transaction.is_active_step(&event.step_name) {
            tracing::warn!(
                expected = ?transaction.active_step().map(|s| s.name.as_str()),
                "step completed does not match current step, dropping"
            );
            record_dropped("step_mismatch");
            return Ok(());
        }

        let now = self.clock.now();
        if let Some(started_at) = transaction.active_step().and_then(|s| s.started_at)
            && let Ok(elapsed) = (now - started_at).to_std()
        {
            metrics::histogram!("saga_step_duration_seconds").record(elapsed.as_secs_f64());
        }

        transaction.complete_active_step(now, event.payload);
        self.repository.save(&transaction).await?;
        tracing::info!(current_step = transaction.current_step(), "step completed");

        self.progress_transaction(transaction_id).await
    }

    /// Marks the active step failed and requests compensation.
    #[tracing::instrument(
        skip(self, event),
        fields(transaction_id = %event.transaction_id, step = %event.step_name)
    )]
    pub async fn handle_step_failed(&self, event: TransactionEvent) -> Result<()> {
        let transaction_id = event.transaction_id;
        let _guard = self.locks.acquire(transaction_id).await;

        let Some(mut transaction) = self.repository.load(transaction_id).await? else {
            tracing::warn!("step failed for unknown transaction, dropping");
            record_dropped("missing_transaction");
            return Ok(());
        };
        if !transaction.status().can_progress() {
            tracing::warn!(status = %transaction.status(), "step failed for inactive transaction, dropping");
            record_dropped("not_in_progress");
            return Ok(());
        }
        if !transaction.is_active_step(&event.step_name) {
            tracing::warn!(
                expected = ?transaction.active_step().map(|s| s.name.as_str()),
                "step failed does not match current step, dropping"
            );
            record_dropped("step_mismatch");
            return Ok(());
        }

        let error = event
            .error
            .unwrap_or_else(|| DEFAULT_STEP_ERROR.to_string());
        transaction.fail_active_step(error.clone());
        self.repository.save(&transaction).await?;
        metrics::counter!("saga_step_failures_total").increment(1);
        tracing::warn!(%error, "step failed");

        self.start_compensation(transaction_id).await
    }

    /// Publishes a compensation-start event naming the step that failed.
    ///
    /// The compensation itself runs when the event comes back in
    /// [`handle_compensation_start`](Self::handle_compensation_start).
    #[tracing::instrument(skip(self))]
    pub async fn start_compensation(&self, transaction_id: TransactionId) -> Result<()> {
        let Some(transaction) = self.repository.load(transaction_id).await? else {
            tracing::warn!("cannot compensate unknown transaction");
            return Ok(());
        };

        let event = CompensationEvent {
            transaction_id,
            process_type: transaction.process_type().to_string(),
            step_name: transaction.active_step().map(|s| s.name.clone()),
            status: transaction.status(),
            error: transaction.error().map(str::to_string),
        };
        self.bus
            .publish(ControlTopic::CompensationStart.as_str(), &event)
            .await?;
        tracing::info!(status = %transaction.status(), "compensation requested");
        Ok(())
    }

    pub async fn handle_compensation_start(&self, event: CompensationEvent) -> Result<()> {
        self.execute_compensation(
            event.transaction_id,
            &event.process_type,
            event.step_name.as_deref(),
        )
        .await
    }

    /// Dispatches compensation commands for every completed step before the
    /// active one, latest first, then marks the transaction compensated.
    ///
    /// Each step is marked compensated and persisted as its command goes out;
    /// participants do not acknowledge compensation. A transaction already
    /// compensating (or compensated) is left alone. An unknown transaction
    /// gets a placeholder record in `Compensating` so that a late
    /// compensation-completed event has something to update.
    #[tracing::instrument(skip(self, process_type))]
    pub async fn execute_compensation(
        &self,
        transaction_id: TransactionId,
        process_type: &str,
        failed_step: Option<&str>,
    ) -> Result<()> {
        let _guard = self.locks.acquire(transaction_id).await;

        let Some(mut transaction) = self.repository.load(transaction_id).await? else {
            tracing::warn!("compensation for unknown transaction, recording placeholder");
            let placeholder = DistributedTransaction::placeholder(
                transaction_id,
                process_type,
                TransactionStatus::Compensating,
                None,
                self.clock.now(),
            );
            self.repository.save(&placeholder).await?;
            return Ok(());
        };
        if transaction.status().is_compensating() {
            tracing::debug!(status = %transaction.status(), "compensation already underway");
            return Ok(());
        }

        transaction.begin_compensation();
        self.repository.save(&transaction).await?;
        tracing::info!("compensation started");

        for index in transaction.compensation_plan() {
            transaction.mark_step_compensated(index);
            self.repository.save(&transaction).await?;

            let step_name = transaction.steps()[index].name.clone();
            let topic = compensate_topic(transaction.process_type(), &step_name);
            let command = CompensationCommand {
                transaction_id,
                process_type: transaction.process_type().to_string(),
                step_name,
                payload: transaction.payload().clone(),
            };
            self.bus.publish(&topic, &command).await?;
            tracing::debug!(%topic, "compensation command published");
        }

        transaction.finish_compensation(self.clock.now());
        self.repository.save(&transaction).await?;
        metrics::counter!("saga_transactions_compensated_total").increment(1);
        tracing::info!("transaction compensated");

        let event = CompensationEvent {
            transaction_id,
            process_type: transaction.process_type().to_string(),
            step_name: failed_step.map(str::to_string),
            status: transaction.status(),
            error: transaction.error().map(str::to_string),
        };
        self.bus
            .publish(ControlTopic::CompensationCompleted.as_str(), &event)
            .await?;
        Ok(())
    }

    /// Times out a transaction whose active step is still the one the
    /// checker saw running, then requests compensation.
    #[tracing::instrument(
        skip(self, event),
        fields(transaction_id = %event.transaction_id, step = %event.step_name)
    )]
    pub async fn handle_transaction_timeout(&self, event: TimeoutEvent) -> Result<()> {
        let transaction_id = event.transaction_id;
        let _guard = self.locks.acquire(transaction_id).await;

        let Some(mut transaction) = self.repository.load(transaction_id).await? else {
            tracing::warn!("timeout for unknown transaction, dropping");
            record_dropped("missing_transaction");
            return Ok(());
        };
        if transaction.status() != TransactionStatus::InProgress
            || !transaction.is_active_step(&event.step_name)
        {
            tracing::debug!(status = %transaction.status(), "stale timeout, dropping");
            record_dropped("stale_timeout");
            return Ok(());
        }

        transaction.mark_timed_out(TIMEOUT_ERROR);
        self.repository.save(&transaction).await?;
        metrics::counter!("saga_transactions_timed_out_total").increment(1);
        tracing::warn!(started_at = %timestamp::format(&event.started_at), "transaction timed out");

        self.start_compensation(transaction_id).await
    }

    /// Records the end of compensation.
    ///
    /// Duplicates are no-ops; an unknown transaction gets a terminal
    /// placeholder record.
    #[tracing::instrument(skip(self, event), fields(transaction_id = %event.transaction_id))]
    pub async fn handle_compensation_completed(&self, event: CompensationEvent) -> Result<()> {
        let transaction_id = event.transaction_id;
        let _guard = self.locks.acquire(transaction_id).await;

        let Some(mut transaction) = self.repository.load(transaction_id).await? else {
            tracing::warn!("compensation completed for unknown transaction, recording placeholder");
            let placeholder = DistributedTransaction::placeholder(
                transaction_id,
                event.process_type,
                TransactionStatus::Compensated,
                event.error,
                self.clock.now(),
            );
            self.repository.save(&placeholder).await?;
            return Ok(());
        };

        match transaction.status() {
            TransactionStatus::Compensated => {
                tracing::debug!("transaction already compensated");
            }
            TransactionStatus::Failed
            | TransactionStatus::TimedOut
            | TransactionStatus::Compensating => {
                transaction.finish_compensation(self.clock.now());
                self.repository.save(&transaction).await?;
                tracing::info!("transaction marked compensated");
            }
            status => {
                tracing::warn!(%status, "compensation completed for transaction not compensating, dropping");
                record_dropped("incompatible_state");
            }
        }
        Ok(())
    }

    /// Records the completion of every step.
    ///
    /// Duplicates are no-ops; an unknown transaction gets a terminal
    /// placeholder record.
    #[tracing::instrument(skip(self, event), fields(transaction_id = %event.transaction_id))]
    pub async fn handle_transaction_completed(
        &self,
        event: TransactionCompletedEvent,
    ) -> Result<()> {
        let transaction_id = event.transaction_id;
        let _guard = self.locks.acquire(transaction_id).await;

        let Some(mut transaction) = self.repository.load(transaction_id).await? else {
            tracing::warn!("transaction completed for unknown transaction, recording placeholder");
            let placeholder = DistributedTransaction::placeholder(
                transaction_id,
                event.process_type,
                TransactionStatus::Completed,
                None,
                self.clock.now(),
            );
            self.repository.save(&placeholder).await?;
            return Ok(());
        };

        match transaction.status() {
            TransactionStatus::Completed => {
                tracing::debug!("transaction already completed");
            }
            status if status.can_progress() && transaction.all_steps_completed() => {
                transaction.complete(event.completed_at);
                self.repository.save(&transaction).await?;
                tracing::info!("transaction marked completed");
            }
            status => {
                tracing::warn!(%status, "transaction completed event does not match state, dropping");
                record_dropped("incompatible_state");
            }
        }
        Ok(())
    }

    /// Scans every persisted transaction once and publishes a timeout event
    /// for each one whose active step has run longer than the step timeout.
    ///
    /// Returns the number of timeout events published. Unreadable records and
    /// failed publishes are logged and skipped.
    #[tracing::instrument(skip(self))]
    pub async fn check_timeouts(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut published = 0;

        for transaction_id in self.repository.list_ids().await? {
            let transaction = match self.repository.load(transaction_id).await {
                Ok(Some(transaction)) => transaction,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(%transaction_id, error = %e, "skipping transaction in timeout scan");
                    continue;
                }
            };
            if transaction.status() != TransactionStatus::InProgress {
                continue;
            }
            let Some(step) = transaction.active_step() else {
                continue;
            };
            let Some(started_at) = step.started_at else {
                continue;
            };
            let expired = (now - started_at)
                .to_std()
                .is_ok_and(|elapsed| elapsed > self.config.step_timeout);
            if !expired {
                continue;
            }

            let event = TimeoutEvent {
                transaction_id,
                process_type: transaction.process_type().to_string(),
                step_name: step.name.clone(),
                started_at,
            };
            match self
                .bus
                .publish(ControlTopic::TransactionTimeout.as_str(), &event)
                .await
            {
                Ok(()) => {
                    tracing::info!(%transaction_id, step = %step.name, "step exceeded timeout");
                    published += 1;
                }
                Err(e) => {
                    tracing::error!(%transaction_id, error = %e, "failed to publish timeout event");
                }
            }
        }
        Ok(published)
    }
}

/// Decodes messages on one control topic and hands them to the coordinator.
struct ControlHandler<S: StateStore + 'static> {
    coordinator: Weak<SagaCoordinator<S>>,
    topic: ControlTopic,
}

#[async_trait]
impl<S: StateStore + 'static> MessageHandler for ControlHandler<S> {
    async fn handle(&self, message: InboundMessage) -> HandlerResult {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return Ok(());
        };

        let control = match ControlMessage::decode(self.topic, message.payload) {
            Ok(control) => control,
            Err(e) => {
                tracing::warn!(topic = %self.topic, error = %e, "dropping malformed control message");
                record_dropped("invalid_message");
                return Ok(());
            }
        };
        let span = tracing::debug_span!(
            "control_message",
            topic = %self.topic,
            transaction_id = %control.transaction_id()
        );
        coordinator.dispatch(control).instrument(span).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StepStatus;
    use crate::transaction::{Payload, StepDefinition};
    use message_bus::{HandlerError, InMemoryBroker, MessageBusConfig, handler_fn};
    use serde_json::{Value, json};
    use state_store::InMemoryStateStore;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    struct Fixture {
        coordinator: Arc<SagaCoordinator<InMemoryStateStore>>,
        broker: InMemoryBroker,
    }

    fn coordinator(config: SagaConfig) -> Fixture {
        let broker = InMemoryBroker::new();
        let bus = Arc::new(MessageBus::new(
            Arc::new(broker.clone()),
            MessageBusConfig::default(),
        ));
        let coordinator = Arc::new(SagaCoordinator::new(bus, InMemoryStateStore::new(), config));
        Fixture {
            coordinator,
            broker,
        }
    }

    /// A usable coordinator without control subscriptions, so every handler
    /// runs only when a test calls it.
    async fn fixture_with(config: SagaConfig) -> Fixture {
        let f = coordinator(config);
        f.coordinator.bus.initialize().await.unwrap();
        f.coordinator.initialized.store(true, Ordering::Release);
        f
    }

    async fn fixture() -> Fixture {
        fixture_with(SagaConfig::default()).await
    }

    fn order_approval() -> StartTransaction {
        let mut payload = Payload::new();
        payload.insert("orderId".to_string(), json!("o1"));
        StartTransaction::new(
            "ORDER_APPROVAL",
            vec![
                StepDefinition::new("update-status", "order-service"),
                StepDefinition::new("generate-invoice", "invoice-service"),
            ],
            payload,
            "u1",
        )
    }

    fn step_event(id: TransactionId, step: &str, status: StepStatus) -> TransactionEvent {
        TransactionEvent {
            transaction_id: id,
            process_type: "ORDER_APPROVAL".to_string(),
            step_name: step.to_string(),
            status,
            payload: None,
            error: (status == StepStatus::Failed).then(|| "x".to_string()),
        }
    }

    async fn state(fixture: &Fixture, id: TransactionId) -> DistributedTransaction {
        fixture
            .coordinator
            .get_transaction_state(id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_before_initialize_fails() {
        let f = coordinator(SagaConfig::default());
        let result = f.coordinator.start_transaction(order_approval()).await;
        assert!(matches!(result, Err(SagaError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_initialize_subscribes_control_topics() {
        let f = coordinator(SagaConfig::default());
        f.coordinator.initialize().await.unwrap();
        f.coordinator.initialize().await.unwrap();
        assert!(f.coordinator.is_initialized());

        let topics = f.coordinator.bus().subscribed_topics().await;
        for topic in ControlTopic::ALL {
            assert!(topics.contains(&topic.as_str().to_string()), "missing {topic}");
        }
        assert_eq!(topics.len(), ControlTopic::ALL.len());
    }

    #[tokio::test]
    async fn test_start_dispatches_first_step() {
        let f = fixture().await;
        let id = f.coordinator.start_transaction(order_approval()).await.unwrap();

        let tx = state(&f, id).await;
        assert_eq!(tx.status(), TransactionStatus::InProgress);
        assert_eq!(tx.current_step(), 0);
        assert!(tx.steps()[0].started_at.is_some());
        assert!(tx.steps()[1].started_at.is_none());

        let sent = f.broker.sent_json("ORDER_APPROVAL-step-update-status").await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["transactionId"], id.to_string());
        assert_eq!(sent[0]["payload"]["orderId"], "o1");
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_persisted() {
        let f = fixture().await;
        let request = StartTransaction::new("", vec![], Payload::new(), "u1");
        let result = f.coordinator.start_transaction(request).await;
        assert!(matches!(result, Err(SagaError::InvalidRequest(_))));
        assert!(f.coordinator.repository().list_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_step_list_completes_immediately() {
        let f = fixture().await;
        let request = StartTransaction::new("NOOP", vec![], Payload::new(), "u1");
        let id = f.coordinator.start_transaction(request).await.unwrap();

        let tx = state(&f, id).await;
        assert_eq!(tx.status(), TransactionStatus::Completed);
        assert_eq!(f.broker.sent_json("transaction-completed").await.len(), 1);
    }

    #[tokio::test]
    async fn test_step_completed_advances_and_merges_output() {
        let f = fixture().await;
        let id = f.coordinator.start_transaction(order_approval()).await.unwrap();

        let mut event = step_event(id, "update-status", StepStatus::Completed);
        let mut output = Payload::new();
        output.insert("statusUpdated".to_string(), json!(true));
        event.payload = Some(output);
        f.coordinator.handle_step_completed(event).await.unwrap();

        let tx = state(&f, id).await;
        assert_eq!(tx.current_step(), 1);
        assert_eq!(tx.steps()[0].status, StepStatus::Completed);
        assert_eq!(tx.payload()["statusUpdated"], true);

        let sent = f.broker.sent_json("ORDER_APPROVAL-step-generate-invoice").await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["payload"]["statusUpdated"], true);
    }

    #[tokio::test]
    async fn test_duplicate_step_completed_is_dropped() {
        let f = fixture().await;
        let id = f.coordinator.start_transaction(order_approval()).await.unwrap();

        let event = step_event(id, "update-status", StepStatus::Completed);
        f.coordinator.handle_step_completed(event.clone()).await.unwrap();
        f.coordinator.handle_step_completed(event).await.unwrap();

        let tx = state(&f, id).await;
        assert_eq!(tx.current_step(), 1);
        assert_eq!(
            f.broker
                .sent_json("ORDER_APPROVAL-step-generate-invoice")
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_mismatched_step_completed_is_dropped() {
        let f = fixture().await;
        let id = f.coordinator.start_transaction(order_approval()).await.unwrap();
        let before = state(&f, id).await;

        f.coordinator
            .handle_step_completed(step_event(id, "generate-invoice", StepStatus::Completed))
            .await
            .unwrap();

        assert_eq!(state(&f, id).await, before);
    }

    #[tokio::test]
    async fn test_events_for_unknown_transactions_are_dropped() {
        let f = fixture().await;
        let id = TransactionId::new();
        f.coordinator
            .handle_step_completed(step_event(id, "update-status", StepStatus::Completed))
            .await
            .unwrap();
        f.coordinator
            .handle_step_failed(step_event(id, "update-status", StepStatus::Failed))
            .await
            .unwrap();
        assert!(f.coordinator.get_transaction_state(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_step_failed_requests_compensation() {
        let f = fixture().await;
        let id = f.coordinator.start_transaction(order_approval()).await.unwrap();
        f.coordinator
            .handle_step_completed(step_event(id, "update-status", StepStatus::Completed))
            .await
            .unwrap();
        f.coordinator
            .handle_step_failed(step_event(id, "generate-invoice", StepStatus::Failed))
            .await
            .unwrap();

        let tx = state(&f, id).await;
        assert_eq!(tx.status(), TransactionStatus::Failed);
        assert_eq!(tx.error(), Some("x"));
        assert_eq!(tx.steps()[1].status, StepStatus::Failed);

        let sent = f.broker.sent_json("compensation-start").await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["stepName"], "generate-invoice");
        assert_eq!(sent[0]["status"], "FAILED");
    }

    #[tokio::test]
    async fn test_execute_compensation_reverses_completed_steps() {
        let f = fixture().await;
        let request = StartTransaction::new(
            "P",
            vec![
                StepDefinition::new("a", "s"),
                StepDefinition::new("b", "s"),
                StepDefinition::new("c", "s"),
            ],
            Payload::new(),
            "u",
        );
        let id = f.coordinator.start_transaction(request).await.unwrap();
        for step in ["a", "b"] {
            let mut event = step_event(id, step, StepStatus::Completed);
            event.process_type = "P".to_string();
            f.coordinator.handle_step_completed(event).await.unwrap();
        }
        let mut failed = step_event(id, "c", StepStatus::Failed);
        failed.process_type = "P".to_string();
        f.coordinator.handle_step_failed(failed).await.unwrap();

        f.coordinator
            .execute_compensation(id, "P", Some("c"))
            .await
            .unwrap();

        let tx = state(&f, id).await;
        assert_eq!(tx.status(), TransactionStatus::Compensated);
        assert_eq!(tx.steps()[0].status, StepStatus::Compensated);
        assert_eq!(tx.steps()[1].status, StepStatus::Compensated);
        assert_eq!(tx.steps()[2].status, StepStatus::Failed);

        let order: Vec<String> = f
            .broker
            .history()
            .await
            .into_iter()
            .map(|r| r.topic)
            .filter(|t| t.starts_with("P-compensate-"))
            .collect();
        assert_eq!(order, vec!["P-compensate-b", "P-compensate-a"]);
        assert_eq!(f.broker.sent_json("compensation-completed").await.len(), 1);

        // Second run is a no-op.
        f.coordinator
            .execute_compensation(id, "P", Some("c"))
            .await
            .unwrap();
        assert_eq!(f.broker.sent_json("compensation-completed").await.len(), 1);
    }

    #[tokio::test]
    async fn test_compensation_for_unknown_transaction_writes_placeholder() {
        let f = fixture().await;
        let id = TransactionId::new();
        f.coordinator.execute_compensation(id, "P", None).await.unwrap();

        let tx = state(&f, id).await;
        assert_eq!(tx.status(), TransactionStatus::Compensating);
        assert_eq!(tx.process_type(), "P");
        assert!(f.broker.sent_json("compensation-completed").await.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_only_applies_while_in_progress() {
        let f = fixture().await;
        let id = f.coordinator.start_transaction(order_approval()).await.unwrap();
        let timeout = TimeoutEvent {
            transaction_id: id,
            process_type: "ORDER_APPROVAL".to_string(),
            step_name: "update-status".to_string(),
            started_at: timestamp::now(),
        };

        // Stale: the step it names has already completed.
        f.coordinator
            .handle_step_completed(step_event(id, "update-status", StepStatus::Completed))
            .await
            .unwrap();
        f.coordinator
            .handle_transaction_timeout(timeout.clone())
            .await
            .unwrap();
        assert_eq!(state(&f, id).await.status(), TransactionStatus::InProgress);

        let current = TimeoutEvent {
            step_name: "generate-invoice".to_string(),
            ..timeout
        };
        f.coordinator
            .handle_transaction_timeout(current.clone())
            .await
            .unwrap();
        let tx = state(&f, id).await;
        assert_eq!(tx.status(), TransactionStatus::TimedOut);
        assert_eq!(tx.error(), Some(TIMEOUT_ERROR));

        // No longer in progress, so a repeat is ignored.
        f.coordinator.handle_transaction_timeout(current).await.unwrap();
        assert_eq!(f.broker.sent_json("compensation-start").await.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_writers_are_idempotent() {
        let f = fixture().await;
        let id = TransactionId::new();
        let completed = TransactionCompletedEvent {
            transaction_id: id,
            process_type: "P".to_string(),
            status: TransactionStatus::Completed,
            completed_at: timestamp::now(),
        };
        f.coordinator
            .handle_transaction_completed(completed.clone())
            .await
            .unwrap();
        f.coordinator
            .handle_transaction_completed(completed)
            .await
            .unwrap();
        assert_eq!(state(&f, id).await.status(), TransactionStatus::Completed);

        let other = TransactionId::new();
        let compensated = CompensationEvent {
            transaction_id: other,
            process_type: "P".to_string(),
            step_name: None,
            status: TransactionStatus::Compensated,
            error: Some("x".to_string()),
        };
        f.coordinator
            .handle_compensation_completed(compensated.clone())
            .await
            .unwrap();
        f.coordinator
            .handle_compensation_completed(compensated)
            .await
            .unwrap();
        let tx = state(&f, other).await;
        assert_eq!(tx.status(), TransactionStatus::Compensated);
        assert_eq!(tx.error(), Some("x"));
    }

    #[tokio::test]
    async fn test_compensation_completed_does_not_overwrite_completed() {
        let f = fixture().await;
        let request = StartTransaction::new("NOOP", vec![], Payload::new(), "u1");
        let id = f.coordinator.start_transaction(request).await.unwrap();

        f.coordinator
            .handle_compensation_completed(CompensationEvent {
                transaction_id: id,
                process_type: "NOOP".to_string(),
                step_name: None,
                status: TransactionStatus::Compensated,
                error: None,
            })
            .await
            .unwrap();
        assert_eq!(state(&f, id).await.status(), TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_check_timeouts_publishes_for_stuck_steps() {
        let f = fixture_with(SagaConfig::default().with_step_timeout(Duration::ZERO)).await;
        let id = f.coordinator.start_transaction(order_approval()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(f.coordinator.check_timeouts().await.unwrap(), 1);
        let sent = f.broker.sent_json("timeout").await;
        assert_eq!(sent[0]["transactionId"], id.to_string());
        assert_eq!(sent[0]["stepName"], "update-status");
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let f = fixture().await;
        f.coordinator.disconnect().await.unwrap();
        f.coordinator.disconnect().await.unwrap();
        assert!(!f.coordinator.is_initialized());

        let result = f.coordinator.start_transaction(order_approval()).await;
        assert!(matches!(result, Err(SagaError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_disconnect_leaves_control_topics() {
        let f = coordinator(SagaConfig::default());
        f.coordinator.initialize().await.unwrap();
        assert_eq!(f.broker.group_count("step-completed").await, 1);

        f.coordinator.disconnect().await.unwrap();
        assert!(f.coordinator.bus().subscribed_topics().await.is_empty());
        for topic in ControlTopic::ALL {
            assert_eq!(f.broker.group_count(topic.as_str()).await, 0, "{topic}");
        }

        // Rejoining picks control traffic up again.
        f.coordinator.initialize().await.unwrap();
        let id = f.coordinator.start_transaction(order_approval()).await.unwrap();
        f.coordinator
            .bus()
            .publish(
                ControlTopic::StepCompleted.as_str(),
                &step_event(id, "update-status", StepStatus::Completed),
            )
            .await
            .unwrap();

        for _ in 0..100 {
            if state(&f, id).await.current_step() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("step-completed was not handled after re-initialize");
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_step_timeout_is_detected_by_next_scan() {
        let f = coordinator(SagaConfig::default());
        f.coordinator.initialize().await.unwrap();

        let observer = MessageBus::new(Arc::new(f.broker.clone()), MessageBusConfig::default());
        observer.initialize().await.unwrap();
        let (tx, mut timeouts) = mpsc::unbounded_channel::<(Instant, Value)>();
        observer
            .subscribe(
                ControlTopic::TransactionTimeout.as_str(),
                handler_fn(move |message: InboundMessage| {
                    let tx = tx.clone();
                    async move {
                        tx.send((Instant::now(), message.payload))?;
                        Ok::<(), HandlerError>(())
                    }
                }),
                Some("observer"),
            )
            .await
            .unwrap();

        let started = Instant::now();
        let id = f.coordinator.start_transaction(order_approval()).await.unwrap();

        let (at, event) = tokio::time::timeout(Duration::from_secs(600), timeouts.recv())
            .await
            .expect("no timeout event")
            .unwrap();
        let elapsed = at - started;
        assert!(elapsed > Duration::from_secs(4 * 60 + 59), "fired after {elapsed:?}");
        assert!(elapsed <= Duration::from_secs(5 * 60 + 60), "fired after {elapsed:?}");
        assert_eq!(event["transactionId"], id.to_string());
        assert_eq!(event["stepName"], "update-status");

        // The coordinator consumes its own timeout event, so later scans stay quiet.
        assert!(
            tokio::time::timeout(Duration::from_secs(300), timeouts.recv())
                .await
                .is_err()
        );
        assert_ne!(state(&f, id).await.status(), TransactionStatus::InProgress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_purges_expired_transactions() {
        let config = SagaConfig::default()
            .with_timeout_check_interval(Duration::from_secs(60))
            .with_transaction_ttl(Duration::from_secs(90));
        let f = coordinator(config);
        f.coordinator.initialize().await.unwrap();
        let store = f.coordinator.repository().store().clone();

        let id = f.coordinator.start_transaction(order_approval()).await.unwrap();
        assert_eq!(store.len().await, 1);

        // Expires at 90s; the scan at 120s drops it.
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(f.coordinator.get_transaction_state(id).await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }
}
