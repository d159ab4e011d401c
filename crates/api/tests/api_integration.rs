//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use api::AppState;
use api::config::Config;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use state_store::InMemoryStateStore;
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

async fn setup_with_config(
    config: Config,
) -> (axum::Router, Arc<AppState<InMemoryStateStore>>) {
    let state = api::start_services(InMemoryStateStore::new(), &config)
        .await
        .unwrap();
    let app = api::create_app(state.clone(), get_metrics_handle());
    (app, state)
}

async fn setup() -> axum::Router {
    setup_with_config(Config::default()).await.0
}

fn order_approval_body() -> Body {
    Body::from(
        serde_json::to_string(&serde_json::json!({
            "processType": "ORDER_APPROVAL",
            "steps": [
                {"name": "update-status", "service": "order-service"},
                {"name": "generate-invoice", "service": "invoice-service"}
            ],
            "payload": {"orderId": "o1"},
            "initiatedBy": "u1"
        }))
        .unwrap(),
    )
}

async fn post_transaction(app: &axum::Router, body: Body) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/transactions")
                .header("content-type", "application/json")
                .body(body)
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn get_path(app: &axum::Router, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let app = setup().await;

    let response = get_path(&app, "/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ok");
}

#[tokio::test]
async fn test_health_reports_unavailable_after_shutdown() {
    let (app, state) = setup_with_config(Config::default()).await;
    api::shutdown_services(&state).await;

    let response = get_path(&app, "/health").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = post_transaction(&app, order_approval_body()).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_start_and_get_transaction() {
    let app = setup().await;

    let response = post_transaction(&app, order_approval_body()).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let created = json_body(response).await;
    let id = created["transactionId"].as_str().unwrap().to_string();

    let response = get_path(&app, &format!("/transactions/{id}")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let tx = json_body(response).await;
    assert_eq!(tx["transactionId"], id);
    assert_eq!(tx["status"], "IN_PROGRESS");
    assert_eq!(tx["currentStep"], 0);
    assert!(tx["steps"][0]["startedAt"].as_str().is_some());
    assert_eq!(tx["payload"]["orderId"], "o1");
}

#[tokio::test]
async fn test_loopback_participants_complete_transaction() {
    let config = Config {
        loopback_steps: api::config::parse_steps(
            "ORDER_APPROVAL:update-status,ORDER_APPROVAL:generate-invoice",
        ),
        ..Config::default()
    };
    let (app, _state) = setup_with_config(config).await;

    let created = json_body(post_transaction(&app, order_approval_body()).await).await;
    let uri = format!("/transactions/{}", created["transactionId"].as_str().unwrap());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let tx = json_body(get_path(&app, &uri).await).await;
        if tx["status"] == "COMPLETED" {
            assert_eq!(tx["currentStep"], 2);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "transaction never completed: {tx}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_invalid_request_is_rejected() {
    let app = setup().await;

    let body = Body::from(
        serde_json::to_string(&serde_json::json!({
            "processType": "",
            "steps": [],
            "initiatedBy": "u1"
        }))
        .unwrap(),
    );
    let response = post_transaction(&app, body).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response).await["error"].as_str().is_some());
}

#[tokio::test]
async fn test_malformed_body_is_client_error() {
    let app = setup().await;

    let response = post_transaction(&app, Body::from(r#"{"steps": 1}"#)).await;
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_get_nonexistent_transaction() {
    let app = setup().await;
    let fake_id = uuid::Uuid::new_v4();

    let response = get_path(&app, &format!("/transactions/{fake_id}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_get_with_invalid_id() {
    let app = setup().await;

    let response = get_path(&app, "/transactions/not-a-uuid").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup().await;
    let response = post_transaction(&app, order_approval_body()).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = get_path(&app, "/metrics").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("saga_transactions_started_total"));
}

#[tokio::test]
async fn test_nats_url_selects_nats_broker() {
    // Nothing listens on port 1, so only the NATS broker fails to connect.
    let config = Config {
        nats_url: Some("nats://127.0.0.1:1".to_string()),
        ..Config::default()
    };
    let result = api::start_services(InMemoryStateStore::new(), &config).await;
    assert!(matches!(result, Err(saga::SagaError::MessageBus(_))));

    assert!(api::start_services(InMemoryStateStore::new(), &Config::default())
        .await
        .is_ok());
}
