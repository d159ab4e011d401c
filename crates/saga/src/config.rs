use std::time::Duration;

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Consumer group for the control-topic subscriptions.
    pub group_id: String,
    /// How often the timeout checker scans persisted transactions.
    pub timeout_check_interval: Duration,
    /// How long the active step may run before the transaction times out.
    pub step_timeout: Duration,
    /// Time-to-live of every persisted transaction. Must exceed the longest
    /// plausible saga, or in-flight transactions expire underneath it.
    pub transaction_ttl: Duration,
    /// Prefix of every transaction key in the state store.
    pub key_prefix: String,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            group_id: "saga-coordinator".to_string(),
            timeout_check_interval: Duration::from_secs(60),
            step_timeout: Duration::from_secs(5 * 60),
            transaction_ttl: Duration::from_secs(24 * 60 * 60),
            key_prefix: "global:transaction:".to_string(),
        }
    }
}

impl SagaConfig {
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    pub fn with_timeout_check_interval(mut self, interval: Duration) -> Self {
        self.timeout_check_interval = interval;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_transaction_ttl(mut self, ttl: Duration) -> Self {
        self.transaction_ttl = ttl;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}
