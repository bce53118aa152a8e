//! Lifecycle state derived from a job record.

use serde::{Deserialize, Serialize};

use super::job::{JobRecord, JobStatus};

/// Lifecycle state of a job.
///
/// State transitions:
/// - Pending -> Picked -> Done
/// - Pending -> Picked -> Pending (retryable failure, re-published after backoff)
/// - Pending -> Picked -> Failed (retry budget exhausted, dead-lettered)
/// - Failed -> Pending (manual requeue only)
///
/// The state is never stored; it is read off the record's columns so the
/// durable store remains the only source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Pending,
    Picked,
    Done,
    Failed,
}

impl LifecycleState {
    pub fn of(record: &JobRecord) -> Self {
        match record.status {
            JobStatus::Done => LifecycleState::Done,
            JobStatus::Failed => LifecycleState::Failed,
            JobStatus::Pending if record.picked_at.is_some() => LifecycleState::Picked,
            JobStatus::Pending => LifecycleState::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Done | LifecycleState::Failed)
    }

    /// Eligible for a dispatch entry.
    pub fn is_runnable(self) -> bool {
        matches!(self, LifecycleState::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobUpdate, RecordId};
    use chrono::Utc;
    use ulid::Ulid;

    #[test]
    fn states_follow_columns() {
        let now = Utc::now();
        let mut job = JobRecord::new(
            RecordId::from_ulid(Ulid::new()),
            "email",
            "e1",
            serde_json::Value::Null,
            now,
        );
        assert_eq!(job.state(), LifecycleState::Pending);
        assert!(job.state().is_runnable());

        job.apply(&JobUpdate::Picked { at: now });
        assert_eq!(job.state(), LifecycleState::Picked);
        assert!(!job.state().is_runnable());

        job.apply(&JobUpdate::Retry {
            reason: "x".into(),
            at: now,
        });
        assert_eq!(job.state(), LifecycleState::Pending);

        job.apply(&JobUpdate::Picked { at: now });
        job.apply(&JobUpdate::Finished { at: now });
        assert!(job.state().is_terminal());
    }
}
