/// Builder for constructing worker pools.
pub mod builder;
/// Worker pool supervising job execution.
pub mod supervisor;
/// Per-worker configuration.
pub mod worker;

pub use builder::WorkerPoolBuilder;
pub use supervisor::{DispatchStatus, JobDispatcher, ShutdownToken, WorkerPool, WorkerPoolConfig};
pub use worker::WorkerConfig;
