use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::driver::{CallContext, ExecutorDriver};
use crate::error::{DriverError, Result, SchedulerError};
use crate::scheduler::debug::{DebugPhase, Introspection};
use crate::scheduler::job::{Executor, Id, Job, Run, Situation};
use crate::scheduler::placement::{self, Action};
use crate::scheduler::registry::Registry;

/// Commands accepted by the control loop.
#[derive(Debug)]
pub enum Command<I> {
    AddJob(Job<I>),
    RemoveJob(I),
    StopJob(I),
    ChangeJob(Job<I>),
    /// The owner confirms a started job is running.
    JobIsRunning(I),
    AddExecutor(Executor<I>),
    RemoveExecutor(I),
    ChangeExecutor(Executor<I>),
    SetExecutorIsAlive(I),
    /// The executor hosts exactly these jobs.
    SetJobsOnExecutor { executor_id: I, job_ids: Vec<I> },
    SetTotalMaxJobCount(usize),
    /// Run a reconcile pass now.
    Refresh,
    /// Verify the registry invariants once the loop has nothing left to do.
    CheckInvariants,
}

/// A command together with the channel its outcome is reported on. The reply
/// is sent after the reconcile pass that follows the command.
#[derive(Debug)]
pub struct Request<I> {
    pub command: Command<I>,
    pub response_tx: oneshot::Sender<Result<()>>,
}

/// Completion of a start or stop call, pushed by the call's task.
#[derive(Debug)]
pub(crate) enum Internal<I> {
    StartFinished {
        job_id: I,
        attempt: u64,
        result: std::result::Result<(), DriverError>,
    },
    StopFinished {
        job_id: I,
        attempt: u64,
        result: std::result::Result<(), DriverError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Start,
    Stop,
}

/// Owner of all scheduler state. Runs as a single task; every mutation
/// happens here.
pub struct ControlLoop<I: Id> {
    config: SchedulerConfig,
    registry: Registry<I>,
    driver: Arc<dyn ExecutorDriver<I>>,
    clock: Arc<dyn Clock>,
    introspection: Introspection<I>,
    internal_tx: mpsc::UnboundedSender<Internal<I>>,
    shutdown: CancellationToken,
    /// Parent of every call's cancel token. Cancelled with `shutdown`; replaced
    /// when draining so the final stops are not born cancelled.
    calls: CancellationToken,
    /// Start/stop calls whose completion has not been received yet.
    in_flight: usize,
    refresh_pending: bool,
    wake_at: Option<Instant>,
    /// `CheckInvariants` requests waiting for a pass with nothing to do.
    settle_waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl<I: Id> ControlLoop<I> {
    pub(crate) fn new(
        config: SchedulerConfig,
        driver: Arc<dyn ExecutorDriver<I>>,
        clock: Arc<dyn Clock>,
        introspection: Introspection<I>,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Internal<I>>) {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let control = Self {
            config,
            registry: Registry::new(),
            driver,
            clock,
            introspection,
            internal_tx,
            calls: shutdown.child_token(),
            shutdown,
            in_flight: 0,
            refresh_pending: false,
            wake_at: None,
            settle_waiters: Vec::new(),
        };
        (control, internal_rx)
    }

    /// Serve commands until shutdown, then drain every run off its executor.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Request<I>>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal<I>>,
    ) {
        tracing::info!("Scheduler loop started");
        let shutdown = self.shutdown.clone();

        loop {
            let sleep_for = self
                .wake_at
                .map(|at| at.saturating_duration_since(self.clock.now()));
            let mut reply: Option<(oneshot::Sender<Result<()>>, Result<()>)> = None;

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(event) = internal_rx.recv() => {
                    self.handle_internal(event).await;
                }

                request = commands.recv() => {
                    let Some(Request { command, response_tx }) = request else {
                        tracing::info!("All scheduler handles dropped");
                        break;
                    };
                    if matches!(command, Command::CheckInvariants) {
                        self.settle_waiters.push(response_tx);
                    } else {
                        let result = self.handle_command(command).await;
                        reply = Some((response_tx, result));
                    }
                }

                _ = std::future::ready(()), if self.refresh_pending => {}

                _ = tokio::time::sleep(sleep_for.unwrap_or_default()), if sleep_for.is_some() => {
                    self.wake_at = None;
                }
            }

            self.refresh_pending = false;
            self.reconcile().await;
            self.project().await;

            if let Some((response_tx, result)) = reply {
                let _ = response_tx.send(result);
            }
            if !self.refresh_pending && !self.settle_waiters.is_empty() {
                let verdict = self.verify();
                for response_tx in self.settle_waiters.drain(..) {
                    let _ = response_tx.send(verdict.clone());
                }
            }
        }

        self.drain(commands, internal_rx).await;
    }

    async fn handle_command(&mut self, command: Command<I>) -> Result<()> {
        let now = self.clock.now();
        match command {
            Command::AddJob(job) => {
                let (id, name) = (job.id.clone(), job.name.clone());
                self.registry.add_job(job)?;
                self.introspection.enter(&id, DebugPhase::Existing, now).await;
                self.introspection.set_names(&id, Some(&name), None).await;
                tracing::info!(job_id = %id, job_name = %name, "Job added");
                Ok(())
            }
            Command::RemoveJob(job_id) => self.stop_run(&job_id, true, now).await,
            Command::StopJob(job_id) => self.stop_run(&job_id, false, now).await,
            Command::ChangeJob(job) => {
                let (id, name) = (job.id.clone(), job.name.clone());
                self.registry.change_job(job)?;
                self.introspection.set_names(&id, Some(&name), None).await;
                tracing::info!(job_id = %id, "Job changed");
                Ok(())
            }
            Command::JobIsRunning(job_id) => self.mark_running(&job_id, now).await,
            Command::AddExecutor(executor) => {
                let id = executor.id.clone();
                self.registry.add_executor(executor, now)?;
                tracing::info!(executor_id = %id, "Executor added");
                Ok(())
            }
            Command::RemoveExecutor(executor_id) => {
                self.registry.remove_executor(&executor_id)?;
                tracing::info!(executor_id = %executor_id, "Executor removed");
                Ok(())
            }
            Command::ChangeExecutor(executor) => {
                let id = executor.id.clone();
                let revised = self.registry.change_executor(executor)?;
                tracing::info!(executor_id = %id, revised, "Executor changed");
                Ok(())
            }
            Command::SetExecutorIsAlive(executor_id) => {
                self.registry.set_executor_alive(&executor_id, now)?;
                tracing::trace!(executor_id = %executor_id, "Executor keepalive");
                Ok(())
            }
            Command::SetJobsOnExecutor {
                executor_id,
                job_ids,
            } => self.set_jobs_on_executor(executor_id, job_ids, now).await,
            Command::SetTotalMaxJobCount(count) => {
                self.config.total_max_job_count = count;
                tracing::info!(count, "Total max job count set");
                Ok(())
            }
            Command::Refresh => Ok(()),
            Command::CheckInvariants => self.verify(),
        }
    }

    async fn handle_internal(&mut self, event: Internal<I>) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let now = self.clock.now();
        match event {
            Internal::StartFinished {
                job_id,
                attempt,
                result,
            } => self.start_finished(job_id, attempt, result, now).await,
            Internal::StopFinished {
                job_id,
                attempt,
                result,
            } => self.end_run(job_id, attempt, result, now).await,
        }
    }

    /// One decision pass: apply at most one action from the planner.
    async fn reconcile(&mut self) {
        let now = self.clock.now();
        let plan = placement::plan(&self.registry, &self.config, now);

        for job_id in &plan.unplaceable {
            if let Some(run) = self.registry.run(job_id).cloned() {
                tracing::debug!(job_id = %job_id, cost = run.job.cost, "No executor fits job");
                self.situation(&run, Situation::NoWorkersToRunJob, None);
            }
        }

        match plan.action {
            Some(Action::Stop { job_id, reason }) => {
                tracing::debug!(job_id = %job_id, %reason, "Stopping job");
                if let Err(e) = self.stop_run(&job_id, false, now).await {
                    tracing::error!(job_id = %job_id, error = %e, "Planned stop failed");
                }
                self.refresh_pending = true;
            }
            Some(Action::Start {
                job_id,
                executor_id,
            }) => {
                if let Err(e) = self.start_run(&job_id, &executor_id, now).await {
                    tracing::error!(job_id = %job_id, error = %e, "Planned start failed");
                }
                self.refresh_pending = true;
            }
            None => self.wake_at = plan.wake_at,
        }
    }

    async fn start_run(&mut self, job_id: &I, executor_id: &I, now: Instant) -> Result<()> {
        let executor = self
            .registry
            .executor(executor_id)
            .ok_or_else(|| SchedulerError::ExecutorNotFound(executor_id.to_string()))?;
        let (executor_name, changed_count) = (executor.name.clone(), executor.changed_count);
        let job = self
            .registry
            .job(job_id)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        let run = self
            .registry
            .run_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;

        run.job = job;
        run.stopped_at = None;
        run.removing = false;
        run.started_at = Some(now);
        run.ran_at = None;
        run.executor_id = Some(executor_id.clone());
        run.executor_changed_count = Some(changed_count);
        run.attempt += 1;
        let snapshot = run.clone();

        self.introspection.enter(job_id, DebugPhase::Starting, now).await;
        self.introspection
            .set_names(job_id, None, Some(&executor_name))
            .await;
        tracing::info!(job_id = %job_id, executor_id = %executor_id, "Starting job");
        self.situation(&snapshot, Situation::JobStarted, None);
        self.spawn_call(CallKind::Start, snapshot);
        Ok(())
    }

    async fn start_finished(
        &mut self,
        job_id: I,
        attempt: u64,
        result: std::result::Result<(), DriverError>,
        now: Instant,
    ) {
        let Some(run) = self.registry.run_mut(&job_id) else {
            tracing::debug!(job_id = %job_id, "Start finished for removed job");
            return;
        };
        if run.attempt != attempt || run.stopping || run.started_at.is_none() {
            tracing::debug!(job_id = %job_id, attempt, "Ignoring stale start completion");
            return;
        }

        match result {
            Ok(()) => {
                if self.config.job_is_running_on_successful_start {
                    if let Err(e) = self.mark_running(&job_id, now).await {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to mark job running");
                    }
                }
            }
            Err(err) => {
                let executor_id = run.executor_id.take();
                run.executor_changed_count = None;
                run.started_at = None;
                run.ran_at = None;
                run.stopped_at = Some(now);
                let snapshot = run.clone();
                tracing::warn!(
                    job_id = %job_id,
                    executor_id = ?executor_id,
                    error = %err,
                    "Error starting job"
                );
                self.introspection.enter(&job_id, DebugPhase::Existing, now).await;
                self.situation(&snapshot, Situation::ErrorStartingJob, Some(&err));
            }
        }
    }

    async fn mark_running(&mut self, job_id: &I, now: Instant) -> Result<()> {
        let run = self
            .registry
            .run_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        if run.stopping || !run.is_starting() {
            tracing::debug!(job_id = %job_id, state = %run.state(), "Job is not starting, running report ignored");
            return Ok(());
        }
        run.ran_at = Some(now);
        let snapshot = run.clone();
        self.introspection.enter(job_id, DebugPhase::Running, now).await;
        tracing::info!(job_id = %job_id, executor_id = ?snapshot.executor_id, "Job running");
        self.situation(&snapshot, Situation::JobRunning, None);
        Ok(())
    }

    /// Begin stopping a run. A run that is not on an executor has nothing to
    /// stop; when removing, it is deleted at once.
    async fn stop_run(&mut self, job_id: &I, remove: bool, now: Instant) -> Result<()> {
        let run = self
            .registry
            .run_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;

        if run.stopping {
            if remove && !run.removing {
                run.removing = true;
                tracing::info!(job_id = %job_id, "Upgrading stop to remove");
            }
            return Ok(());
        }

        if run.executor_id.is_none() {
            if remove {
                self.registry.remove_run(job_id);
                self.introspection.enter(job_id, DebugPhase::Gone, now).await;
                tracing::info!(job_id = %job_id, "Job removed");
            }
            return Ok(());
        }

        run.stopping = true;
        run.removing = remove;
        run.stopped_at = Some(now);
        run.ran_at = None;
        run.started_at = None;
        run.executor_changed_count = None;
        run.attempt += 1;
        let snapshot = run.clone();

        self.introspection.enter(job_id, DebugPhase::Ending, now).await;
        tracing::info!(job_id = %job_id, executor_id = ?snapshot.executor_id, remove, "Stopping job");
        self.situation(&snapshot, Situation::JobStopped, None);
        self.spawn_call(CallKind::Stop, snapshot);
        Ok(())
    }

    /// The stop call for a run returned.
    async fn end_run(
        &mut self,
        job_id: I,
        attempt: u64,
        result: std::result::Result<(), DriverError>,
        now: Instant,
    ) {
        let Some(run) = self.registry.run(&job_id).cloned() else {
            tracing::debug!(job_id = %job_id, "Stop finished for unknown job");
            return;
        };
        if run.attempt != attempt || !run.stopping {
            tracing::debug!(job_id = %job_id, attempt, "Ignoring stale stop completion");
            return;
        }
        if let Err(err) = &result {
            tracing::warn!(job_id = %job_id, executor_id = ?run.executor_id, error = %err, "Stopping job on executor failed");
            self.situation(&run, Situation::RemoveJobFromExecutorFailed, Some(err));
        }

        let fresh = self.registry.job(&job_id).cloned();
        let Some(run) = self.registry.run_mut(&job_id) else {
            return;
        };
        if let Some(job) = fresh {
            run.job = job;
        }
        run.executor_id = None;
        run.stopping = false;
        let removing = run.removing;
        let snapshot = run.clone();

        if removing {
            self.registry.remove_run(&job_id);
            self.introspection.enter(&job_id, DebugPhase::Gone, now).await;
            tracing::info!(job_id = %job_id, "Job removed");
        } else {
            self.introspection.enter(&job_id, DebugPhase::Existing, now).await;
            tracing::debug!(job_id = %job_id, "Job ended");
            self.situation(&snapshot, Situation::JobEnded, None);
        }
    }

    async fn set_jobs_on_executor(&mut self, executor_id: I, job_ids: Vec<I>, now: Instant) -> Result<()> {
        let changed_count = self
            .registry
            .executor(&executor_id)
            .map(|e| e.changed_count)
            .ok_or_else(|| SchedulerError::ExecutorNotFound(executor_id.to_string()))?;
        let mut listed: HashSet<I> = HashSet::new();
        let hosted: Vec<I> = job_ids
            .into_iter()
            .filter(|id| listed.insert(id.clone()))
            .collect();

        let forgotten: Vec<I> = self
            .registry
            .runs_on_executor(&executor_id)
            .into_iter()
            .filter(|r| !r.stopping && !listed.contains(&r.job.id))
            .map(|r| r.job.id.clone())
            .collect();
        for job_id in forgotten {
            if let Some(run) = self.registry.run_mut(&job_id) {
                run.executor_id = None;
                run.executor_changed_count = None;
                run.started_at = None;
                run.ran_at = None;
                run.stopped_at = Some(now);
                run.attempt += 1;
            }
            self.introspection.enter(&job_id, DebugPhase::Existing, now).await;
            tracing::info!(job_id = %job_id, executor_id = %executor_id, "Executor no longer hosts job");
        }

        for job_id in hosted {
            let Some(run) = self.registry.run(&job_id) else {
                tracing::warn!(job_id = %job_id, executor_id = %executor_id, "Executor hosts unknown job");
                let mut stranger = Run::new(Job::new(job_id.clone(), 0.0), 0);
                stranger.executor_id = Some(executor_id.clone());
                self.situation(&stranger, Situation::UnknownJobOnExecutor, None);
                continue;
            };
            if run.stopping || run.is_bound_to(&executor_id) {
                continue;
            }
            if run.executor_id.is_some() {
                tracing::info!(job_id = %job_id, executor_id = %executor_id, "Job hosted on two executors");
                self.stop_run(&job_id, false, now).await?;
                continue;
            }

            // Pending here but already hosted by the executor. Keep it there
            // only if placement would have put it there; otherwise take it off.
            let adopt = placement::admits(&self.registry, &self.config, &executor_id, run.job.cost, now);
            let Some(run) = self.registry.run_mut(&job_id) else {
                continue;
            };
            run.executor_id = Some(executor_id.clone());
            run.executor_changed_count = Some(changed_count);
            run.stopped_at = None;
            if adopt {
                run.started_at = Some(now);
                run.ran_at = Some(now);
                run.attempt += 1;
                self.introspection.enter(&job_id, DebugPhase::Running, now).await;
                tracing::info!(job_id = %job_id, executor_id = %executor_id, "Adopted job hosted by executor");
            } else {
                tracing::info!(job_id = %job_id, executor_id = %executor_id, "Executor hosts job it has no room for");
                self.stop_run(&job_id, false, now).await?;
            }
        }
        Ok(())
    }

    /// Run a start or stop call on its own task and report back through the
    /// internal channel. Errors, deadline overruns and panics all come back
    /// as a `DriverError`.
    fn spawn_call(&mut self, kind: CallKind, run: Run<I>) {
        let driver = self.driver.clone();
        let internal_tx = self.internal_tx.clone();
        let limit = self.config.slow_funcs_timeout;
        let deadline = limit.and_then(|l| self.clock.now().checked_add(l));
        let cancel = self.calls.child_token();
        let job_id = run.job.id.clone();
        let attempt = run.attempt;
        self.in_flight += 1;

        tokio::spawn(async move {
            let ctx = CallContext::new(deadline, cancel.clone());
            let mut call = tokio::spawn(async move {
                match kind {
                    CallKind::Start => driver.start_job(run, ctx).await,
                    CallKind::Stop => driver.stop_job(run, ctx).await,
                }
            });

            let result = match limit {
                Some(limit) => match tokio::time::timeout(limit, &mut call).await {
                    Ok(joined) => flatten(joined),
                    Err(_) => {
                        cancel.cancel();
                        Err(DriverError::Timeout)
                    }
                },
                None => flatten(call.await),
            };

            let event = match kind {
                CallKind::Start => Internal::StartFinished {
                    job_id,
                    attempt,
                    result,
                },
                CallKind::Stop => Internal::StopFinished {
                    job_id,
                    attempt,
                    result,
                },
            };
            let _ = internal_tx.send(event);
        });
    }

    fn situation(&self, run: &Run<I>, situation: Situation, details: Option<&DriverError>) {
        let driver = &self.driver;
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            driver.handle_situation(run, situation, details)
        }));
        if outcome.is_err() {
            tracing::error!(job_id = %run.job.id, %situation, "Situation handler panicked");
        }
    }

    async fn project(&self) {
        self.introspection
            .project_executors(&self.registry, &self.config, self.clock.now())
            .await;
        if cfg!(debug_assertions) && !self.refresh_pending {
            if let Err(e) = self.verify() {
                tracing::error!(error = %e, "Registry invariant violated");
            }
        }
    }

    fn verify(&self) -> Result<()> {
        self.registry
            .check_invariants(&self.config)
            .map_err(SchedulerError::InvariantViolated)
    }

    /// Stop taking commands, stop every run that is on an executor and wait
    /// until every outstanding call has reported back.
    async fn drain(
        &mut self,
        mut commands: mpsc::Receiver<Request<I>>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal<I>>,
    ) {
        commands.close();
        while let Ok(request) = commands.try_recv() {
            let _ = request.response_tx.send(Err(SchedulerError::Shutdown));
        }
        for response_tx in self.settle_waiters.drain(..) {
            let _ = response_tx.send(Err(SchedulerError::Shutdown));
        }
        // Calls still running were cancelled with the shutdown token.
        self.calls = CancellationToken::new();
        tracing::info!(in_flight = self.in_flight, "Scheduler draining");

        loop {
            let now = self.clock.now();
            let bound: Vec<I> = self
                .registry
                .runs()
                .into_iter()
                .filter(|r| r.executor_id.is_some() && !r.stopping)
                .map(|r| r.job.id.clone())
                .collect();
            for job_id in bound {
                if let Err(e) = self.stop_run(&job_id, false, now).await {
                    tracing::error!(job_id = %job_id, error = %e, "Stop during drain failed");
                }
            }
            self.project().await;

            if self.in_flight == 0 {
                break;
            }
            match internal_rx.recv().await {
                Some(event) => self.handle_internal(event).await,
                None => break,
            }
        }

        tracing::info!("Scheduler stopped");
    }
}

fn flatten(
    joined: std::result::Result<std::result::Result<(), DriverError>, JoinError>,
) -> std::result::Result<(), DriverError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(DriverError::Panicked(msg))
        }
        Err(_) => Err(DriverError::Cancelled),
    }
}
