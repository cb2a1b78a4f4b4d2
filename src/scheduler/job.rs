use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Identifier of a job or an executor. The scheduler only compares, hashes
/// and logs ids.
pub trait Id: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static {}

impl<T> Id for T where T: Clone + Eq + Hash + Debug + Display + Send + Sync + 'static {}

/// A unit of work to place on an executor.
#[derive(Debug, Clone, PartialEq)]
pub struct Job<I> {
    pub id: I,
    pub name: String,
    /// How long the job runs once running. `Duration::ZERO` runs until stopped.
    pub duration: Duration,
    /// Share of an executor's `cost_capacity` the job uses.
    pub cost: f64,
    /// Revision of the definition, bumped by the scheduler on every change.
    pub changed_count: u64,
}

impl<I: Id> Job<I> {
    pub fn new(id: I, cost: f64) -> Self {
        Self {
            name: id.to_string(),
            id,
            duration: Duration::ZERO,
            cost,
            changed_count: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// A target that runs jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct Executor<I> {
    pub id: I,
    pub name: String,
    pub cost_capacity: f64,
    pub paused: bool,
    /// Last keepalive. `None` when adding means "alive as of now".
    pub kept_alive_at: Option<Instant>,
    /// Hash of executor-side settings; a change restarts every job on it.
    pub settings_hash: u64,
    /// Revision bumped by the scheduler when capacity or settings change.
    pub changed_count: u64,
}

impl<I: Id> Executor<I> {
    pub fn new(id: I, cost_capacity: f64) -> Self {
        Self {
            name: id.to_string(),
            id,
            cost_capacity,
            paused: false,
            kept_alive_at: None,
            settings_hash: 0,
            changed_count: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    pub fn with_settings_hash(mut self, hash: u64) -> Self {
        self.settings_hash = hash;
        self
    }

    pub fn with_kept_alive_at(mut self, at: Instant) -> Self {
        self.kept_alive_at = Some(at);
        self
    }
}

/// The binding of a job to an executor.
///
/// Lifecycle: pending (no executor) → starting (`started_at`) → running
/// (`ran_at`) → stopping → pending again, or deleted when `removing`.
#[derive(Debug, Clone, PartialEq)]
pub struct Run<I> {
    /// Snapshot of the job taken when the run was placed.
    pub job: Job<I>,
    pub executor_id: Option<I>,
    pub executor_changed_count: Option<u64>,
    pub started_at: Option<Instant>,
    pub ran_at: Option<Instant>,
    pub stopped_at: Option<Instant>,
    pub stopping: bool,
    pub removing: bool,
    /// Insertion ordinal, used as a stable tiebreak.
    pub count: u64,
    /// Bumped on every start and stop so late completions can be matched
    /// against the call that produced them.
    pub attempt: u64,
}

impl<I: Id> Run<I> {
    pub fn new(job: Job<I>, count: u64) -> Self {
        Self {
            job,
            executor_id: None,
            executor_changed_count: None,
            started_at: None,
            ran_at: None,
            stopped_at: None,
            stopping: false,
            removing: false,
            count,
            attempt: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.executor_id.is_none() && !self.stopping
    }

    pub fn is_starting(&self) -> bool {
        self.started_at.is_some() && self.ran_at.is_none()
    }

    pub fn is_running(&self) -> bool {
        self.ran_at.is_some()
    }

    pub fn is_bound_to(&self, executor_id: &I) -> bool {
        self.executor_id.as_ref() == Some(executor_id)
    }

    pub fn state(&self) -> RunState {
        if self.stopping {
            RunState::Stopping
        } else if self.ran_at.is_some() {
            RunState::Running
        } else if self.started_at.is_some() {
            RunState::Starting
        } else {
            RunState::Pending
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Starting => write!(f, "starting"),
            RunState::Running => write!(f, "running"),
            RunState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Named event reported to the owner through `ExecutorDriver::handle_situation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Situation {
    JobStarted,
    JobRunning,
    JobStopped,
    JobEnded,
    NoWorkersToRunJob,
    RemoveJobFromExecutorFailed,
    ErrorStartingJob,
    /// An executor reported hosting a job the scheduler does not know.
    UnknownJobOnExecutor,
}

impl std::fmt::Display for Situation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Situation::JobStarted => write!(f, "job started"),
            Situation::JobRunning => write!(f, "job running"),
            Situation::JobStopped => write!(f, "job stopped"),
            Situation::JobEnded => write!(f, "job ended"),
            Situation::NoWorkersToRunJob => write!(f, "no workers fit to run job"),
            Situation::RemoveJobFromExecutorFailed => {
                write!(f, "remove job from executor failed")
            }
            Situation::ErrorStartingJob => write!(f, "error starting job"),
            Situation::UnknownJobOnExecutor => write!(f, "unknown job on executor"),
        }
    }
}
