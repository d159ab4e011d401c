//! Background detection of stuck transactions.

use std::sync::Weak;
use std::time::Duration;

use state_store::StateStore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::coordinator::SagaCoordinator;

/// Periodically runs [`SagaCoordinator::check_timeouts`] and purges expired
/// transaction records.
///
/// Holds only a weak reference, so the task ends on its own once the
/// coordinator is dropped. Stopping (or dropping) the checker aborts the task.
pub(crate) struct TimeoutChecker {
    task: JoinHandle<()>,
}

impl TimeoutChecker {
    pub(crate) fn spawn<S>(coordinator: Weak<SagaCoordinator<S>>, period: Duration) -> Self
    where
        S: StateStore + 'static,
    {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                match coordinator.check_timeouts().await {
                    Ok(0) => {}
                    Ok(timed_out) => {
                        tracing::info!(timed_out, "timeout scan published timeout events");
                    }
                    Err(e) => tracing::error!(error = %e, "timeout scan failed"),
                }
                match coordinator.repository().purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "purged expired transactions"),
                    Err(e) => tracing::warn!(error = %e, "purge of expired transactions failed"),
                }
            }
            tracing::debug!("timeout checker stopped");
        });
        Self { task }
    }

    pub(crate) fn stop(self) {
        self.task.abort();
    }
}

impl Drop for TimeoutChecker {
    fn drop(&mut self) {
        self.task.abort();
    }
}
