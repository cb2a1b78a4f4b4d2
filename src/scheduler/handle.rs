use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, TokioClock};
use crate::config::SchedulerConfig;
use crate::driver::ExecutorDriver;
use crate::error::{Result, SchedulerError};
use crate::scheduler::control::{Command, ControlLoop, Request};
use crate::scheduler::debug::{ExecutorDebug, Introspection, JobDebug};
use crate::scheduler::job::{Executor, Id, Job};

/// Entry point for starting a scheduler.
pub struct Scheduler;

impl Scheduler {
    /// Spawn the control loop on the current runtime using tokio's clock.
    pub fn spawn<I: Id>(
        config: SchedulerConfig,
        driver: Arc<dyn ExecutorDriver<I>>,
    ) -> Result<(SchedulerHandle<I>, JoinHandle<()>)> {
        Self::spawn_with_clock(config, driver, Arc::new(TokioClock))
    }

    pub fn spawn_with_clock<I: Id>(
        config: SchedulerConfig,
        driver: Arc<dyn ExecutorDriver<I>>,
        clock: Arc<dyn Clock>,
    ) -> Result<(SchedulerHandle<I>, JoinHandle<()>)> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(config.command_channel_capacity);
        let shutdown = CancellationToken::new();
        let introspection = Introspection::new(clock.clone());

        let (control, internal_rx) = ControlLoop::new(
            config,
            driver,
            clock,
            introspection.clone(),
            shutdown.clone(),
        );
        let join = tokio::spawn(control.run(command_rx, internal_rx));

        let handle = SchedulerHandle {
            command_tx,
            shutdown,
            introspection,
        };
        Ok((handle, join))
    }
}

/// Cloneable handle used to drive a running scheduler.
///
/// Every method waits until the control loop has applied the command and run
/// the reconcile pass that follows it.
#[derive(Clone)]
pub struct SchedulerHandle<I: Id> {
    command_tx: mpsc::Sender<Request<I>>,
    shutdown: CancellationToken,
    introspection: Introspection<I>,
}

impl<I: Id> SchedulerHandle<I> {
    async fn send(&self, command: Command<I>) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(Request {
                command,
                response_tx,
            })
            .await
            .map_err(|_| SchedulerError::Shutdown)?;
        response_rx.await.map_err(|_| SchedulerError::Shutdown)?
    }

    pub async fn add_job(&self, job: Job<I>) -> Result<()> {
        self.send(Command::AddJob(job)).await
    }

    /// Stop the job if it is on an executor, then forget it.
    pub async fn remove_job(&self, job_id: I) -> Result<()> {
        self.send(Command::RemoveJob(job_id)).await
    }

    /// Stop the job. It stays known and may be placed again.
    pub async fn stop_job(&self, job_id: I) -> Result<()> {
        self.send(Command::StopJob(job_id)).await
    }

    pub async fn change_job(&self, job: Job<I>) -> Result<()> {
        self.send(Command::ChangeJob(job)).await
    }

    pub async fn job_is_running(&self, job_id: I) -> Result<()> {
        self.send(Command::JobIsRunning(job_id)).await
    }

    pub async fn add_executor(&self, executor: Executor<I>) -> Result<()> {
        self.send(Command::AddExecutor(executor)).await
    }

    pub async fn remove_executor(&self, executor_id: I) -> Result<()> {
        self.send(Command::RemoveExecutor(executor_id)).await
    }

    pub async fn change_executor(&self, executor: Executor<I>) -> Result<()> {
        self.send(Command::ChangeExecutor(executor)).await
    }

    pub async fn set_executor_is_alive(&self, executor_id: I) -> Result<()> {
        self.send(Command::SetExecutorIsAlive(executor_id)).await
    }

    pub async fn set_jobs_on_executor(&self, executor_id: I, job_ids: Vec<I>) -> Result<()> {
        self.send(Command::SetJobsOnExecutor {
            executor_id,
            job_ids,
        })
        .await
    }

    pub async fn set_total_max_job_count(&self, count: usize) -> Result<()> {
        self.send(Command::SetTotalMaxJobCount(count)).await
    }

    pub async fn refresh(&self) -> Result<()> {
        self.send(Command::Refresh).await
    }

    /// Wait until the loop has no action left to take, then check the
    /// registry invariants. A violation comes back as
    /// `SchedulerError::InvariantViolated`.
    pub async fn check_invariants(&self) -> Result<()> {
        self.send(Command::CheckInvariants).await
    }

    /// Ask the control loop to drain and exit. Await the `JoinHandle` returned
    /// by `Scheduler::spawn` to know when every job has been stopped.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn debug_snapshot(&self) -> HashMap<I, JobDebug> {
        self.introspection.jobs().await
    }

    pub async fn executor_snapshot(&self) -> Vec<ExecutorDebug> {
        self.introspection.executors().await
    }
}
