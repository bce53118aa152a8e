//! The durable job record and the transitions applied to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::RecordId;
use super::state::LifecycleState;

/// Terminal/non-terminal status column. `Pending` is the "unset" value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" | "" => Some(JobStatus::Pending),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the append-only `failedReason` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedReason {
    pub reason: String,
    pub time: DateTime<Utc>,
}

/// Snapshot of a previous attempt, recorded when the job goes back to pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub picked_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: JobStatus,
    pub duration: Option<i64>,
}

/// Authoritative job record, one per `(collection, identifier)`.
///
/// The same shape is serialized into the dispatch side store and copied into
/// the dead-letter collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: RecordId,
    pub identifier: String,
    pub name: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub priority: i64,
    /// Scheduling delay in milliseconds.
    #[serde(default)]
    pub delay: i64,
    #[serde(default)]
    pub attempts: u32,
    pub picked_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub requeued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: JobStatus,
    /// `finished_at - picked_at` in milliseconds, set on success.
    pub duration: Option<i64>,
    /// `finished_at - created_at` in milliseconds, set on success.
    pub latency: Option<i64>,
    #[serde(default)]
    pub failed_reason: Vec<FailedReason>,
    #[serde(default)]
    pub run_history: Vec<RunSnapshot>,
}

impl JobRecord {
    pub fn new(
        id: RecordId,
        name: impl Into<String>,
        identifier: impl Into<String>,
        data: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            identifier: identifier.into(),
            name: name.into(),
            data,
            created_at,
            priority: 0,
            delay: 0,
            attempts: 0,
            picked_at: None,
            finished_at: None,
            requeued_at: None,
            status: JobStatus::Pending,
            duration: None,
            latency: None,
            failed_reason: Vec::new(),
            run_history: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: i64) -> Self {
        self.delay = delay;
        self
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::of(self)
    }

    /// Merge a re-submitted record into this one.
    ///
    /// Only producer-owned fields change; id, name, creation time, counters
    /// and history survive so that a resubmission is an upsert, not a reset.
    pub fn resubmit(&mut self, incoming: &JobRecord) {
        self.data = incoming.data.clone();
        self.priority = incoming.priority;
        self.delay = incoming.delay;
    }

    /// Apply a lifecycle transition in place.
    pub fn apply(&mut self, update: &JobUpdate) {
        match update {
            JobUpdate::Picked { at } => {
                self.attempts += 1;
                self.picked_at = Some(*at);
            }
            JobUpdate::Finished { at } => {
                self.finished_at = Some(*at);
                self.duration = self.picked_at.map(|picked| millis_between(picked, *at));
                self.latency = Some(millis_between(self.created_at, *at));
                self.status = JobStatus::Done;
            }
            JobUpdate::Retry { reason, at } => {
                self.run_history.push(RunSnapshot {
                    picked_at: self.picked_at,
                    finished_at: self.finished_at,
                    status: self.status,
                    duration: self.duration,
                });
                self.picked_at = None;
                self.finished_at = None;
                self.status = JobStatus::Pending;
                self.duration = None;
                self.failed_reason.push(FailedReason {
                    reason: reason.clone(),
                    time: *at,
                });
                self.requeued_at = Some(*at);
            }
            JobUpdate::Terminal { reason, at } => {
                self.failed_reason.push(FailedReason {
                    reason: reason.clone(),
                    time: *at,
                });
                self.finished_at = Some(*at);
                self.status = JobStatus::Failed;
                self.requeued_at = Some(*at);
            }
        }
    }
}

/// A transition applied to a durable record by identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    /// `attempts += 1`, `pickedAt = at`.
    Picked { at: DateTime<Utc> },
    /// Success: `finishedAt`, `duration`, `latency`, `status = done`.
    Finished { at: DateTime<Utc> },
    /// Retryable failure: snapshot into `runHistory`, clear the run fields,
    /// append the reason, stamp `requeuedAt`.
    Retry { reason: String, at: DateTime<Utc> },
    /// Exhausted budget: append the reason, `finishedAt`, `status = failed`.
    Terminal { reason: String, at: DateTime<Utc> },
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn record() -> JobRecord {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        JobRecord::new(
            RecordId::from_ulid(Ulid::new()),
            "email",
            "e1",
            serde_json::json!({"data": "x"}),
            created,
        )
    }

    #[test]
    fn picked_increments_attempts() {
        let mut job = record();
        let at = job.created_at + Duration::seconds(1);
        job.apply(&JobUpdate::Picked { at });
        job.apply(&JobUpdate::Picked { at });

        assert_eq!(job.attempts, 2);
        assert_eq!(job.picked_at, Some(at));
        assert_eq!(job.state(), LifecycleState::Picked);
    }

    #[test]
    fn finished_derives_duration_and_latency() {
        let mut job = record();
        let picked = job.created_at + Duration::seconds(2);
        let finished = picked + Duration::milliseconds(1500);
        job.apply(&JobUpdate::Picked { at: picked });
        job.apply(&JobUpdate::Finished { at: finished });

        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.duration, Some(1500));
        assert_eq!(job.latency, Some(3500));
        assert_eq!(job.delay, 0);
    }

    #[test]
    fn retry_clears_run_fields_and_keeps_history() {
        let mut job = record();
        let picked = job.created_at + Duration::seconds(1);
        job.apply(&JobUpdate::Picked { at: picked });
        job.apply(&JobUpdate::Retry {
            reason: "boom".into(),
            at: picked + Duration::seconds(1),
        });

        assert_eq!(job.picked_at, None);
        assert_eq!(job.finished_at, None);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.run_history.len(), 1);
        assert_eq!(job.run_history[0].picked_at, Some(picked));
        assert_eq!(job.failed_reason[0].reason, "boom");
        assert!(job.requeued_at.is_some());
    }

    #[test]
    fn terminal_marks_failed_without_history() {
        let mut job = record();
        let at = job.created_at + Duration::seconds(1);
        job.apply(&JobUpdate::Terminal {
            reason: "gave up".into(),
            at,
        });

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.finished_at, Some(at));
        assert!(job.run_history.is_empty());
        assert_eq!(job.failed_reason.len(), 1);
    }

    #[test]
    fn resubmit_keeps_identity_and_counters() {
        let mut job = record();
        job.apply(&JobUpdate::Picked {
            at: job.created_at,
        });
        let original_id = job.id;
        let original_created = job.created_at;

        let incoming = JobRecord::new(
            RecordId::from_ulid(Ulid::new()),
            "email",
            "e1",
            serde_json::json!({"data": "y"}),
            original_created + Duration::hours(1),
        )
        .with_priority(5);
        job.resubmit(&incoming);

        assert_eq!(job.id, original_id);
        assert_eq!(job.created_at, original_created);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.priority, 5);
        assert_eq!(job.data, serde_json::json!({"data": "y"}));
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let job = record();
        let json = serde_json::to_value(&job).unwrap();

        assert!(json.get("createdAt").is_some());
        assert!(json.get("failedReason").is_some());
        assert_eq!(json["status"], "pending");
    }
}
