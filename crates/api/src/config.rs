//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::SagaConfig;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL state store; unset means in-memory
/// - `NATS_URL`: NATS JetStream message broker; unset means in-process
/// - `SAGA_GROUP_ID`: consumer group of the coordinator
/// - `SAGA_TIMEOUT_CHECK_INTERVAL_SECS`, `SAGA_STEP_TIMEOUT_SECS`,
///   `SAGA_TRANSACTION_TTL_SECS`: coordinator timings
/// - `SAGA_LOOPBACK_STEPS`: comma-separated `PROCESS_TYPE:step` pairs served
///   by in-process participants that always succeed
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub nats_url: Option<String>,
    pub saga: SagaConfig,
    pub loopback_steps: Vec<(String, String)>,
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

fn env_url(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|url| !url.is_empty())
}

/// Parses `"A:x, A:y,B:z"` into `[("A","x"), ("A","y"), ("B","z")]`.
/// Malformed entries are skipped.
pub fn parse_steps(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let (process_type, step) = entry.trim().split_once(':')?;
            let (process_type, step) = (process_type.trim(), step.trim());
            (!process_type.is_empty() && !step.is_empty())
                .then(|| (process_type.to_string(), step.to_string()))
        })
        .collect()
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = SagaConfig::default();
        let saga = SagaConfig {
            group_id: std::env::var("SAGA_GROUP_ID").unwrap_or(defaults.group_id),
            timeout_check_interval: env_secs("SAGA_TIMEOUT_CHECK_INTERVAL_SECS")
                .unwrap_or(defaults.timeout_check_interval),
            step_timeout: env_secs("SAGA_STEP_TIMEOUT_SECS").unwrap_or(defaults.step_timeout),
            transaction_ttl: env_secs("SAGA_TRANSACTION_TTL_SECS")
                .unwrap_or(defaults.transaction_ttl),
            key_prefix: defaults.key_prefix,
        };

        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            database_url: env_url("DATABASE_URL"),
            nats_url: env_url("NATS_URL"),
            saga,
            loopback_steps: std::env::var("SAGA_LOOPBACK_STEPS")
                .map(|raw| parse_steps(&raw))
                .unwrap_or_default(),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            nats_url: None,
            saga: SagaConfig::default(),
            loopback_steps: Vec::new(),
        }
    }
}
