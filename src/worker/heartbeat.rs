use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;
use crate::scheduler::{Id, SchedulerHandle};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically tells the scheduler an executor is alive.
pub struct KeepaliveSender {
    interval: Duration,
}

impl KeepaliveSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// An interval that keeps an executor alive under the given
    /// `executor_alive_duration`.
    pub fn for_alive_duration(alive: Duration) -> Self {
        Self::new(alive / 2)
    }

    /// Send keepalives until cancelled or the scheduler is gone.
    pub async fn run<I: Id>(&self, handle: SchedulerHandle<I>, executor_id: I, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval.max(MIN_INTERVAL));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match handle.set_executor_is_alive(executor_id.clone()).await {
                Ok(()) => {}
                Err(SchedulerError::Shutdown) => break,
                Err(e) => {
                    // Executor was removed; nothing left to keep alive.
                    tracing::debug!(executor_id = %executor_id, error = %e, "Keepalive rejected");
                    break;
                }
            }
        }
    }
}
