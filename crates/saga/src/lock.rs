//! In-process serialization of work on a single transaction.

use std::sync::Arc;

use common::TransactionId;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per transaction ID, created on demand.
///
/// Entries are removed again once no task holds or waits for them. This only
/// narrows races between handlers in the same process; other processes are
/// not excluded.
#[derive(Default)]
pub(crate) struct TransactionLocks {
    locks: DashMap<TransactionId, Arc<Mutex<()>>>,
}

impl TransactionLocks {
    pub(crate) async fn acquire(&self, transaction_id: TransactionId) -> TransactionGuard<'_> {
        let mutex = self.locks.entry(transaction_id).or_default().clone();
        let guard = mutex.lock_owned().await;
        TransactionGuard {
            guard: Some(guard),
            locks: &self.locks,
            transaction_id,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

pub(crate) struct TransactionGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a DashMap<TransactionId, Arc<Mutex<()>>>,
    transaction_id: TransactionId,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // The map's own reference is the only one left when nobody waits.
        self.locks
            .remove_if(&self.transaction_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
