use std::time::Duration;

use crate::error::{Result, SchedulerError};

const DEFAULT_COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Executors are considered dead once this many hundredths of
/// `executor_alive_duration` have passed since their last keepalive.
pub const ALIVE_GRACE_PERCENT: u32 = 140;

/// Tuning for placement, load balancing and callable deadlines.
///
/// All fields are fixed once the scheduler is spawned, except
/// `total_max_job_count` which can be changed at runtime through
/// `SchedulerHandle::set_total_max_job_count`.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Keepalive window. `Duration::ZERO` disables the liveness check.
    pub executor_alive_duration: Duration,

    /// Maximum runs per executor that are started but not yet running.
    pub simultaneous_starts: usize,

    /// Pacing between starts on one executor when `simultaneous_starts > 1`.
    pub min_duration_between_simultaneous_starts: Duration,

    /// Cost difference that triggers moving a running job to a less loaded
    /// executor. Zero disables load balancing.
    pub load_balance_if_cost_difference: f64,

    /// How long a job may outlive its duration (or a paused executor may keep
    /// it) while replacement capacity is found. Zero means hard deadlines.
    pub keep_jobs_beyond_end_until_enough_slack: Duration,

    /// Deadline for each start/stop call. `None` waits forever.
    pub slow_funcs_timeout: Option<Duration>,

    /// Cap on concurrently started runs. Zero is unlimited.
    pub total_max_job_count: usize,

    /// Treat a successful start call as confirmation that the job runs.
    pub job_is_running_on_successful_start: bool,

    /// Bound of the command channel; senders wait when it is full.
    pub command_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            executor_alive_duration: Duration::ZERO,
            simultaneous_starts: 1,
            min_duration_between_simultaneous_starts: Duration::ZERO,
            load_balance_if_cost_difference: 0.0,
            keep_jobs_beyond_end_until_enough_slack: Duration::ZERO,
            slow_funcs_timeout: None,
            total_max_job_count: 0,
            job_is_running_on_successful_start: false,
            command_channel_capacity: DEFAULT_COMMAND_CHANNEL_CAPACITY,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executor_alive_duration(mut self, d: Duration) -> Self {
        self.executor_alive_duration = d;
        self
    }

    pub fn with_simultaneous_starts(mut self, n: usize) -> Self {
        self.simultaneous_starts = n;
        self
    }

    pub fn with_min_duration_between_simultaneous_starts(mut self, d: Duration) -> Self {
        self.min_duration_between_simultaneous_starts = d;
        self
    }

    pub fn with_load_balance_if_cost_difference(mut self, diff: f64) -> Self {
        self.load_balance_if_cost_difference = diff;
        self
    }

    pub fn with_slack(mut self, d: Duration) -> Self {
        self.keep_jobs_beyond_end_until_enough_slack = d;
        self
    }

    pub fn with_slow_funcs_timeout(mut self, d: Duration) -> Self {
        self.slow_funcs_timeout = Some(d);
        self
    }

    pub fn with_total_max_job_count(mut self, n: usize) -> Self {
        self.total_max_job_count = n;
        self
    }

    pub fn with_job_is_running_on_successful_start(mut self, on: bool) -> Self {
        self.job_is_running_on_successful_start = on;
        self
    }

    pub fn with_command_channel_capacity(mut self, n: usize) -> Self {
        self.command_channel_capacity = n;
        self
    }

    /// The window after the last keepalive during which an executor counts
    /// as alive, or `None` when liveness is not checked.
    pub fn alive_window(&self) -> Option<Duration> {
        if self.executor_alive_duration.is_zero() {
            return None;
        }
        let window = self
            .executor_alive_duration
            .checked_mul(ALIVE_GRACE_PERCENT)
            .map_or(Duration::MAX, |d| d / 100);
        Some(window)
    }

    pub fn validate(&self) -> Result<()> {
        if self.simultaneous_starts == 0 {
            return Err(SchedulerError::InvalidConfig(
                "simultaneous_starts must be at least 1".to_string(),
            ));
        }
        if !self.load_balance_if_cost_difference.is_finite()
            || self.load_balance_if_cost_difference < 0.0
        {
            return Err(SchedulerError::InvalidConfig(format!(
                "load_balance_if_cost_difference must be a non-negative number, got {}",
                self.load_balance_if_cost_difference
            )));
        }
        if self.command_channel_capacity == 0 {
            return Err(SchedulerError::InvalidConfig(
                "command_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
