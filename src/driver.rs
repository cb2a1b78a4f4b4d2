use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::DriverError;
use crate::scheduler::job::{Id, Run, Situation};

/// Deadline and cancellation handed to every start/stop call.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// When the scheduler gives up on the call. `None` waits forever.
    pub deadline: Option<Instant>,
    /// Cancelled when the deadline passes or the scheduler starts shutting
    /// down. Stops issued while draining are not cancelled.
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(deadline: Option<Instant>, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }
}

/// The scheduler's view of the outside world.
///
/// `start_job` and `stop_job` may be slow (a request to a remote worker);
/// each call runs on its own task so it never stalls the control loop.
/// `handle_situation` is called from the control loop itself and must
/// return quickly.
#[async_trait]
pub trait ExecutorDriver<I: Id>: Send + Sync + 'static {
    async fn start_job(&self, run: Run<I>, ctx: CallContext) -> Result<(), DriverError>;

    async fn stop_job(&self, run: Run<I>, ctx: CallContext) -> Result<(), DriverError>;

    fn handle_situation(&self, run: &Run<I>, situation: Situation, details: Option<&DriverError>);
}
