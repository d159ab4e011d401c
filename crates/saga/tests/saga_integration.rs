//! End-to-end saga tests over the in-memory bus and state store.

use std::sync::Arc;
use std::time::Duration;

use common::TransactionId;
use message_bus::{InMemoryBroker, MessageBus, MessageBusConfig};
use saga::{
    DistributedTransaction, InMemoryStepExecutor, Payload, SagaConfig, SagaCoordinator,
    StartTransaction, StepDefinition, StepParticipant, StepStatus, TIMEOUT_ERROR,
    TransactionStatus,
};
use serde_json::json;
use state_store::{InMemoryStateStore, StateStore};

struct TestHarness {
    broker: InMemoryBroker,
    bus: Arc<MessageBus>,
    store: InMemoryStateStore,
    coordinator: Arc<SagaCoordinator<InMemoryStateStore>>,
    participant: StepParticipant,
}

impl TestHarness {
    async fn new() -> Self {
        Self::with_config(SagaConfig::default()).await
    }

    async fn with_config(config: SagaConfig) -> Self {
        Self::with_store(InMemoryStateStore::new(), config).await
    }

    async fn with_store(store: InMemoryStateStore, config: SagaConfig) -> Self {
        let broker = InMemoryBroker::new();
        let bus = Arc::new(MessageBus::new(
            Arc::new(broker.clone()),
            MessageBusConfig::default(),
        ));
        let coordinator = Arc::new(SagaCoordinator::new(bus.clone(), store.clone(), config));
        coordinator.initialize().await.unwrap();
        let participant = StepParticipant::new(bus.clone(), "participants");

        Self {
            broker,
            bus,
            store,
            coordinator,
            participant,
        }
    }

    async fn executor(&self, process_type: &str, step_name: &str) -> InMemoryStepExecutor {
        let executor = InMemoryStepExecutor::new();
        self.participant
            .register(process_type, step_name, Arc::new(executor.clone()))
            .await
            .unwrap();
        executor
    }

    async fn state(&self, id: TransactionId) -> Option<DistributedTransaction> {
        self.coordinator.get_transaction_state(id).await.unwrap()
    }

    /// Polls until the transaction reaches `status`.
    async fn wait_for_status(
        &self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> DistributedTransaction {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            if let Some(tx) = self.state(id).await
                && tx.status() == status
            {
                return tx;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "transaction {id} never reached {status}, last state: {:?}",
                self.state(id).await
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Topics sent so far that start with `prefix`, oldest first.
    async fn sent_topics(&self, prefix: &str) -> Vec<String> {
        self.broker
            .history()
            .await
            .into_iter()
            .map(|r| r.topic)
            .filter(|t| t.starts_with(prefix))
            .collect()
    }
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

#[tokio::test]
async fn test_order_approval_completes() {
    let h = TestHarness::new().await;
    let order = h.executor("ORDER_APPROVAL", "update-status").await;
    let invoice = h.executor("ORDER_APPROVAL", "generate-invoice").await;
    let mut output = Payload::new();
    output.insert("statusUpdated".to_string(), json!(true));
    order.set_output(output).await;

    let id = h.coordinator.start_transaction(order_approval()).await.unwrap();
    let tx = h.wait_for_status(id, TransactionStatus::Completed).await;

    assert_eq!(tx.current_step(), 2);
    assert!(tx.completed_at().is_some());
    assert!(tx.steps().iter().all(|s| s.status == StepStatus::Completed));
    assert!(tx.steps().iter().all(|s| s.completed_at.is_some()));
    assert_eq!(tx.payload()["statusUpdated"], true);

    assert_eq!(order.executions().await.len(), 1);
    let invoice_runs = invoice.executions().await;
    assert_eq!(invoice_runs.len(), 1);
    assert_eq!(invoice_runs[0].payload["orderId"], "o1");
    assert_eq!(invoice_runs[0].payload["statusUpdated"], true);

    assert!(order.compensations().await.is_empty());
    let completed = h.broker.sent_json("transaction-completed").await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0]["status"], "COMPLETED");
}

#[tokio::test]
async fn test_failure_at_second_step_compensates_first_only() {
    let h = TestHarness::new().await;
    let order = h.executor("ORDER_APPROVAL", "update-status").await;
    let invoice = h.executor("ORDER_APPROVAL", "generate-invoice").await;
    invoice.set_failure(Some("x")).await;

    let id = h.coordinator.start_transaction(order_approval()).await.unwrap();
    let tx = h.wait_for_status(id, TransactionStatus::Compensated).await;

    assert_eq!(tx.error(), Some("x"));
    assert_eq!(tx.steps()[0].status, StepStatus::Compensated);
    assert_eq!(tx.steps()[1].status, StepStatus::Failed);
    assert_eq!(tx.steps()[1].error.as_deref(), Some("x"));

    assert_eq!(
        h.sent_topics("ORDER_APPROVAL-compensate-").await,
        vec!["ORDER_APPROVAL-compensate-update-status"]
    );
    assert!(invoice.compensations().await.is_empty());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while order.compensations().await.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let compensations = order.compensations().await;
    assert_eq!(compensations.len(), 1);
    assert_eq!(compensations[0].transaction_id, id);
}

#[tokio::test]
async fn test_compensation_runs_in_reverse_order() {
    let h = TestHarness::new().await;
    for step in ["reserve", "charge", "ship"] {
        h.executor("FULFILLMENT", step).await;
    }
    let notify = h.executor("FULFILLMENT", "notify").await;
    notify.set_failure(Some("mail server down")).await;

    let request = StartTransaction::new(
        "FULFILLMENT",
        ["reserve", "charge", "ship", "notify"]
            .into_iter()
            .map(|name| StepDefinition::new(name, "svc"))
            .collect(),
        Payload::new(),
        "u1",
    );
    let id = h.coordinator.start_transaction(request).await.unwrap();
    let tx = h.wait_for_status(id, TransactionStatus::Compensated).await;

    assert_eq!(
        h.sent_topics("FULFILLMENT-compensate-").await,
        vec![
            "FULFILLMENT-compensate-ship",
            "FULFILLMENT-compensate-charge",
            "FULFILLMENT-compensate-reserve",
        ]
    );
    assert_eq!(tx.steps()[3].status, StepStatus::Failed);
    assert_eq!(h.broker.sent_json("compensation-completed").await.len(), 1);
}

#[tokio::test]
async fn test_failure_at_first_step_publishes_no_compensation_commands() {
    let h = TestHarness::new().await;
    let order = h.executor("ORDER_APPROVAL", "update-status").await;
    order.set_failure(Some("locked")).await;

    let id = h.coordinator.start_transaction(order_approval()).await.unwrap();
    let tx = h.wait_for_status(id, TransactionStatus::Compensated).await;

    assert_eq!(tx.current_step(), 0);
    assert!(h.sent_topics("ORDER_APPROVAL-compensate-").await.is_empty());
}

#[tokio::test]
async fn test_start_shows_first_step_in_progress() {
    let h = TestHarness::new().await;

    let id = h.coordinator.start_transaction(order_approval()).await.unwrap();
    let tx = h.state(id).await.unwrap();

    assert_eq!(tx.status(), TransactionStatus::InProgress);
    assert_eq!(tx.current_step(), 0);
    assert!(tx.steps()[0].started_at.is_some());
    assert_eq!(
        h.broker
            .sent_json("ORDER_APPROVAL-step-update-status")
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn test_duplicate_step_completed_over_bus_advances_once() {
    let h = TestHarness::new().await;
    let id = h.coordinator.start_transaction(order_approval()).await.unwrap();

    let event = json!({
        "transactionId": id,
        "processType": "ORDER_APPROVAL",
        "stepName": "update-status",
        "status": "COMPLETED"
    });
    h.bus.publish("step-completed", &event).await.unwrap();
    h.bus.publish("step-completed", &event).await.unwrap();
    // A mismatched event for a step that is not active.
    h.bus
        .publish(
            "step-completed",
            &json!({
                "transactionId": id,
                "processType": "ORDER_APPROVAL",
                "stepName": "unknown-step",
                "status": "COMPLETED"
            }),
        )
        .await
        .unwrap();
    // Sentinel: processed after the three above by the same consumer.
    let sentinel = TransactionId::new();
    h.bus
        .publish(
            "transaction-completed",
            &json!({
                "transactionId": sentinel,
                "processType": "SENTINEL",
                "status": "COMPLETED",
                "completedAt": "2024-01-01T00:00:00.000Z"
            }),
        )
        .await
        .unwrap();
    h.wait_for_status(sentinel, TransactionStatus::Completed).await;

    let tx = h.state(id).await.unwrap();
    assert_eq!(tx.current_step(), 1);
    assert_eq!(tx.status(), TransactionStatus::InProgress);
    assert_eq!(
        h.broker
            .sent_json("ORDER_APPROVAL-step-generate-invoice")
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn test_malformed_control_message_is_dropped() {
    let h = TestHarness::new().await;
    let order = h.executor("ORDER_APPROVAL", "update-status").await;
    h.executor("ORDER_APPROVAL", "generate-invoice").await;

    h.bus
        .publish("step-completed", &json!({"transactionId": "nope"}))
        .await
        .unwrap();
    h.bus
        .publish("step-failed", &json!({"status": "COMPLETED"}))
        .await
        .unwrap();

    let id = h.coordinator.start_transaction(order_approval()).await.unwrap();
    h.wait_for_status(id, TransactionStatus::Completed).await;
    assert_eq!(order.executions().await.len(), 1);
}

#[tokio::test]
async fn test_stuck_step_times_out_and_compensates() {
    let config = SagaConfig::default()
        .with_step_timeout(Duration::from_millis(50))
        .with_timeout_check_interval(Duration::from_millis(20));
    let h = TestHarness::with_config(config).await;
    let order = h.executor("ORDER_APPROVAL", "update-status").await;
    // Nobody executes generate-invoice.

    let id = h.coordinator.start_transaction(order_approval()).await.unwrap();
    let tx = h.wait_for_status(id, TransactionStatus::Compensated).await;

    assert_eq!(tx.error(), Some(TIMEOUT_ERROR));
    assert_eq!(tx.current_step(), 1);
    assert_eq!(tx.steps()[0].status, StepStatus::Compensated);
    assert_eq!(tx.steps()[1].status, StepStatus::Pending);

    let timeouts = h.broker.sent_json("timeout").await;
    assert!(!timeouts.is_empty());
    assert_eq!(timeouts[0]["stepName"], "generate-invoice");
    assert_eq!(order.executions().await.len(), 1);
}

#[tokio::test]
async fn test_completed_transactions_are_not_timed_out() {
    let h = TestHarness::with_config(
        SagaConfig::default().with_step_timeout(Duration::from_millis(1)),
    )
    .await;
    h.executor("ORDER_APPROVAL", "update-status").await;
    h.executor("ORDER_APPROVAL", "generate-invoice").await;

    let id = h.coordinator.start_transaction(order_approval()).await.unwrap();
    h.wait_for_status(id, TransactionStatus::Completed).await;

    assert_eq!(h.coordinator.check_timeouts().await.unwrap(), 0);
}

#[tokio::test]
async fn test_persisted_form_roundtrips() {
    let h = TestHarness::new().await;
    h.executor("ORDER_APPROVAL", "update-status").await;

    let id = h.coordinator.start_transaction(order_approval()).await.unwrap();
    let tx = h.wait_for_status(id, TransactionStatus::InProgress).await;

    let raw = h
        .store
        .get(&format!("global:transaction:{id}"))
        .await
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["transactionId"], id.to_string());
    assert_eq!(value["processType"], "ORDER_APPROVAL");

    let decoded = DistributedTransaction::from_json(&raw).unwrap();
    assert_eq!(decoded, h.state(id).await.unwrap());
    assert_eq!(decoded.steps().len(), tx.steps().len());
}

#[tokio::test]
async fn test_late_terminal_event_for_unknown_transaction_writes_placeholder() {
    let h = TestHarness::new().await;
    let id = TransactionId::new();

    h.bus
        .publish(
            "compensation-completed",
            &json!({
                "transactionId": id,
                "processType": "ORDER_APPROVAL",
                "status": "COMPENSATED",
                "error": "x"
            }),
        )
        .await
        .unwrap();

    let tx = h.wait_for_status(id, TransactionStatus::Compensated).await;
    assert_eq!(tx.process_type(), "ORDER_APPROVAL");
    assert!(tx.steps().is_empty());
}

#[tokio::test]
async fn test_transaction_survives_coordinator_restart() {
    let store = InMemoryStateStore::new();
    let first = TestHarness::with_store(store.clone(), SagaConfig::default()).await;
    let id = first
        .coordinator
        .start_transaction(order_approval())
        .await
        .unwrap();
    first.coordinator.disconnect().await.unwrap();
    first.bus.disconnect().await.unwrap();

    // A fresh process sharing only the state store picks up where it left off.
    let second = TestHarness::with_store(store, SagaConfig::default()).await;
    second.executor("ORDER_APPROVAL", "generate-invoice").await;
    second
        .bus
        .publish(
            "step-completed",
            &json!({
                "transactionId": id,
                "processType": "ORDER_APPROVAL",
                "stepName": "update-status",
                "status": "COMPLETED"
            }),
        )
        .await
        .unwrap();

    let tx = second
        .wait_for_status(id, TransactionStatus::Completed)
        .await;
    assert_eq!(tx.current_step(), 2);
}
