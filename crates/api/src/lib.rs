//! Saga coordinator service.
//!
//! Hosts a [`SagaCoordinator`] over the message bus and exposes an
//! operational HTTP surface: health, Prometheus metrics, and starting and
//! inspecting transactions.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use message_bus::{Broker, InMemoryBroker, MessageBus, MessageBusConfig, NatsBroker, NatsConfig};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{InMemoryStepExecutor, SagaCoordinator, SagaError, StepParticipant};
use state_store::StateStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// Consumer group of the in-process loopback participants.
pub const LOOPBACK_GROUP_ID: &str = "loopback-participants";

/// Shared application state accessible from all handlers.
pub struct AppState<S: StateStore + 'static> {
    pub coordinator: Arc<SagaCoordinator<S>>,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: StateStore + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/transactions", post(routes::transactions::start::<S>))
        .route("/transactions/{id}", get(routes::transactions::get::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Picks the broker: NATS JetStream when `NATS_URL` is set, otherwise the
/// in-process broker, which only reaches participants in this process.
pub fn message_broker(config: &Config) -> Arc<dyn Broker> {
    match &config.nats_url {
        Some(url) => {
            tracing::info!(%url, "using NATS JetStream broker");
            Arc::new(NatsBroker::new(NatsConfig {
                name: Some(config.saga.group_id.clone()),
                ..NatsConfig::new(url.as_str())
            }))
        }
        None => {
            tracing::info!("using in-memory broker");
            Arc::new(InMemoryBroker::new())
        }
    }
}

/// Connects the message bus, initializes the coordinator and registers the
/// configured loopback participants.
pub async fn start_services<S: StateStore + 'static>(
    store: S,
    config: &Config,
) -> Result<Arc<AppState<S>>, SagaError> {
    let bus = Arc::new(MessageBus::new(
        message_broker(config),
        MessageBusConfig::default(),
    ));
    bus.initialize().await?;

    let coordinator = Arc::new(SagaCoordinator::new(
        bus.clone(),
        store,
        config.saga.clone(),
    ));
    coordinator.initialize().await?;

    if !config.loopback_steps.is_empty() {
        let participant = StepParticipant::new(bus, LOOPBACK_GROUP_ID);
        for (process_type, step_name) in &config.loopback_steps {
            participant
                .register(
                    process_type,
                    step_name,
                    Arc::new(InMemoryStepExecutor::new()),
                )
                .await?;
        }
        tracing::info!(
            steps = config.loopback_steps.len(),
            "loopback participants registered"
        );
    }

    Ok(Arc::new(AppState { coordinator }))
}

/// Stops the coordinator, then the bus.
pub async fn shutdown_services<S: StateStore + 'static>(state: &AppState<S>) {
    if let Err(e) = state.coordinator.disconnect().await {
        tracing::error!(error = %e, "failed to disconnect saga coordinator");
    }
    if let Err(e) = state.coordinator.bus().disconnect().await {
        tracing::error!(error = %e, "failed to disconnect message bus");
    }
}
