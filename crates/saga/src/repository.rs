//! Persistence of transactions in the state store.

use std::time::Duration;

use common::TransactionId;
use state_store::StateStore;

use crate::error::Result;
use crate::transaction::DistributedTransaction;

/// Reads and writes transactions under `{key_prefix}{transactionId}`.
#[derive(Clone)]
pub struct TransactionRepository<S: StateStore> {
    store: S,
    key_prefix: String,
    ttl: Duration,
}

impl<S: StateStore> TransactionRepository<S> {
    pub fn new(store: S, key_prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            ttl,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn key(&self, transaction_id: TransactionId) -> String {
        format!("{}{}", self.key_prefix, transaction_id)
    }

    /// Loads a transaction.
    ///
    /// A record that cannot be decoded is logged and reported as missing, so a
    /// single corrupt entry never poisons a caller or the timeout scan.
    pub async fn load(&self, transaction_id: TransactionId) -> Result<Option<DistributedTransaction>> {
        let key = self.key(transaction_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match DistributedTransaction::from_json(&raw) {
            Ok(transaction) => Ok(Some(transaction)),
            Err(e) => {
                tracing::warn!(%key, error = %e, "discarding unreadable transaction state");
                Ok(None)
            }
        }
    }

    /// Writes a transaction, refreshing its TTL.
    pub async fn save(&self, transaction: &DistributedTransaction) -> Result<()> {
        let key = self.key(transaction.transaction_id());
        let raw = transaction.to_json()?;
        self.store.set(&key, &raw, Some(self.ttl)).await?;
        Ok(())
    }

    /// Removes expired records from the store, returning how many went.
    pub async fn purge_expired(&self) -> Result<u64> {
        Ok(self.store.purge_expired().await?)
    }

    /// Lists the IDs of every persisted transaction.
    ///
    /// Keys under the prefix that do not end in a transaction ID are skipped.
    pub async fn list_ids(&self) -> Result<Vec<TransactionId>> {
        let keys = self
            .store
            .keys_by_pattern(&format!("{}*", self.key_prefix))
            .await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(&self.key_prefix))
            .filter_map(|id| id.parse().ok())
            .collect())
    }
}
