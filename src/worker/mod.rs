//! Executor side of the scheduler.
//!
//! # Components
//!
//! - [`SimulatedExecutors`]: in-process `ExecutorDriver` with jittered
//!   latencies and injectable start failures
//! - [`KeepaliveSender`]: periodic `set_executor_is_alive` for one executor

pub mod heartbeat;
pub mod simulated;

pub use heartbeat::KeepaliveSender;
pub use simulated::{SimulatedExecutors, SimulationConfig};
