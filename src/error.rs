use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("Job already exists: {0}")]
    JobExists(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Executor already exists: {0}")]
    ExecutorExists(String),

    #[error("Executor not found: {0}")]
    ExecutorNotFound(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Invalid executor: {0}")]
    InvalidExecutor(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Scheduler is shut down")]
    Shutdown,

    #[error("Invariant violated: {0}")]
    InvariantViolated(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Failure reported by a start or stop callable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("{0}")]
    Failed(String),

    #[error("Call exceeded its deadline")]
    Timeout,

    #[error("Call panicked: {0}")]
    Panicked(String),

    #[error("Call cancelled")]
    Cancelled,
}

impl DriverError {
    pub fn failed(msg: impl Into<String>) -> Self {
        DriverError::Failed(msg.into())
    }
}
