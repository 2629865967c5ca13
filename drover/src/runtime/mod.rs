/// Runtime builder for constructing queue runtimes.
pub mod builder;
/// Runtime supervisor owning the worker pool and housekeeping tasks.
pub mod supervisor;
/// Worker loop: unstick, claim, dispatch, heartbeat and finalize.
pub mod worker;

pub use builder::QueueRuntimeBuilder;
pub use supervisor::{QueueRuntime, ShutdownToken};
pub use worker::{WorkOutcome, Worker};
