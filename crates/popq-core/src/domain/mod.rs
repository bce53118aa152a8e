//! Domain model: identifiers, the job record, its lifecycle and events.

pub mod events;
pub mod ids;
pub mod job;
pub mod state;

pub use self::events::{EventKind, QueueEvent};
pub use self::ids::{LeaseToken, RecordId};
pub use self::job::{FailedReason, JobRecord, JobStatus, JobUpdate, RunSnapshot};
pub use self::state::LifecycleState;
