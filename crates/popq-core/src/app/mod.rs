//! App - wiring and the long-running loops.
//!
//! - **QueueBuilder**: assembles ports and runners into a `JobQueue`
//! - **ExecutionLoop**: dequeue, run handlers, record the outcome
//! - **WorkerHeartbeat**: worker registration and liveness refresh

pub mod builder;
pub mod heartbeat;
pub mod worker_loop;

pub use self::builder::{BuildError, QueueBuilder};
pub use self::heartbeat::WorkerHeartbeat;
pub use self::worker_loop::{ExecutionLoop, JobOutcome, LoopHandle, LoopSettings, SweepOutcome};
