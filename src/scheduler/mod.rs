//! Placement of jobs onto executors.
//!
//! # Components
//!
//! - [`registry`]: tables of jobs, executors and runs
//! - [`capacity`]: per-executor load snapshot
//! - [`placement`]: pure decision pass over the registry
//! - [`control`]: the single task that owns the registry and calls out
//! - [`handle`]: cloneable front end for the control loop
//! - [`debug`]: phase timings and executor summaries for introspection

pub mod capacity;
pub mod control;
pub mod debug;
pub mod handle;
pub mod job;
pub mod placement;
pub mod registry;

pub use debug::{DebugPhase, ExecutorDebug, JobDebug};
pub use handle::{Scheduler, SchedulerHandle};
pub use job::{Executor, Id, Job, Run, RunState, Situation};
pub use registry::Registry;
