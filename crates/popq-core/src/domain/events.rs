//! Events emitted by the lifecycle engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "jobEnqueued")]
    JobEnqueued,
    #[serde(rename = "jobFinished")]
    JobFinished,
    #[serde(rename = "jobRetried")]
    JobRetried,
    #[serde(rename = "jobFailed")]
    JobFailed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::JobEnqueued => "jobEnqueued",
            EventKind::JobFinished => "jobFinished",
            EventKind::JobRetried => "jobRetried",
            EventKind::JobFailed => "jobFailed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub kind: EventKind,
    pub job: JobRecord,
    pub at: DateTime<Utc>,
}

impl QueueEvent {
    pub fn new(kind: EventKind, job: JobRecord, at: DateTime<Utc>) -> Self {
        Self { kind, job, at }
    }
}
