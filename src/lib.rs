pub mod clock;
pub mod config;
pub mod dashboard;
pub mod driver;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod worker;
