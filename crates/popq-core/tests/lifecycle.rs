use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rstest::rstest;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use popq_core::QueueError;
use popq_core::app::{ExecutionLoop, LoopSettings, QueueBuilder};
use popq_core::domain::{EventKind, JobStatus, LifecycleState, RecordId};
use popq_core::impls::{InMemoryDispatchIndex, InMemoryLock};
use popq_core::ports::dispatch_index::lock_key;
use popq_core::ports::{
    Clock, DispatchIndex, DistributedLock, IdGenerator, LockPolicy, ManualClock, RequiredFields,
    UlidGenerator,
};
use popq_core::queue::{
    EnqueueOptions, FailOutcome, JobQueue, NewJob, PageQuery, QueueSettings, RetryPolicy,
    RunnerOptions, handler_fn,
};

fn settings() -> QueueSettings {
    QueueSettings {
        retry_policy: RetryPolicy::immediate(),
        ..QueueSettings::default()
    }
}

fn manual_queue() -> (Arc<JobQueue>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let queue = QueueBuilder::new()
        .with_clock(clock.clone())
        .with_settings(settings())
        .build()
        .unwrap();
    (queue, clock)
}

fn indexed_queue() -> (Arc<JobQueue>, Arc<ManualClock>, Arc<InMemoryDispatchIndex>) {
    let clock = Arc::new(ManualClock::default());
    let index = Arc::new(InMemoryDispatchIndex::new());
    let queue = QueueBuilder::new()
        .with_clock(clock.clone())
        .with_index(index.clone())
        .with_settings(settings())
        .build()
        .unwrap();
    (queue, clock, index)
}

async fn side_payload(index: &InMemoryDispatchIndex, name: &str, identifier: &str) -> Option<String> {
    index
        .payloads(name, &[identifier.to_string()])
        .await
        .unwrap()
        .remove(0)
}

#[rstest]
#[case(&[("low", 0), ("mid", 5), ("high", 10)], &["high", "mid", "low"])]
#[case(&[("a", 1), ("b", 7), ("c", 4)], &["b", "c", "a"])]
#[tokio::test]
async fn higher_priority_pops_first(#[case] jobs: &[(&str, i64)], #[case] expected: &[&str]) {
    let (queue, _clock) = manual_queue();
    for (identifier, priority) in jobs {
        queue
            .enqueue("email", *identifier, json!({}), EnqueueOptions::new().priority(*priority))
            .await
            .unwrap();
    }

    let mut order = Vec::new();
    while let Some(job) = queue.dequeue_one("email").await.unwrap() {
        order.push(job.identifier);
    }
    assert_eq!(order, expected);
}

#[tokio::test]
async fn enqueue_is_an_upsert_by_identifier() {
    let (queue, _clock) = manual_queue();
    let first = queue
        .enqueue("email", "welcome-42", json!({"v": 1}), EnqueueOptions::new())
        .await
        .unwrap();
    let second = queue
        .enqueue("email", "welcome-42", json!({"v": 2}), EnqueueOptions::new())
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.data, json!({"v": 2}));
    assert_eq!(queue.length("email").await.unwrap(), 1);
    assert_eq!(queue.count_in_last_hours("email", 1).await.unwrap(), 1);
}

#[tokio::test]
async fn identifiers_are_scoped_to_their_name() {
    let (queue, _clock, index) = indexed_queue();
    let email = queue
        .enqueue("email", "1", json!({"to": "a"}), EnqueueOptions::new())
        .await
        .unwrap();
    let sms = queue
        .enqueue("sms", "1", json!({"phone": "b"}), EnqueueOptions::new())
        .await
        .unwrap();
    assert_ne!(email.id, sms.id);

    let job = queue.dequeue_one("email").await.unwrap().unwrap();
    assert_eq!(job.name, "email");
    assert_eq!(job.data, json!({"to": "a"}));
    queue.finish(&job).await.unwrap();
    assert_eq!(side_payload(&index, "email", "1").await, None);

    let page = queue.paginate_executed("email", &PageQuery::default()).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, email.id);

    let other = queue.dequeue_one("sms").await.unwrap().unwrap();
    assert_eq!(other.id, sms.id);
    assert_eq!(other.attempts, 1);
    assert_eq!(other.data, json!({"phone": "b"}));
}

#[tokio::test]
async fn dequeue_increments_attempts_and_marks_picked() {
    let (queue, _clock) = manual_queue();
    queue.enqueue("email", "a", json!({}), EnqueueOptions::new()).await.unwrap();

    let job = queue.dequeue_one("email").await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert!(job.picked_at.is_some());
    assert_eq!(LifecycleState::of(&job), LifecycleState::Picked);
    assert_eq!(queue.length("email").await.unwrap(), 0);
    assert!(queue.dequeue_one("email").await.unwrap().is_none());
}

#[tokio::test]
async fn finish_marks_done_and_drops_payload() {
    let (queue, clock, index) = indexed_queue();
    queue
        .enqueue("email", "e1", json!({"data": "x"}), EnqueueOptions::new())
        .await
        .unwrap();
    let job = queue.dequeue_one("email").await.unwrap().unwrap();
    assert_eq!(job.identifier, "e1");
    assert_eq!(job.attempts, 1);
    assert!(side_payload(&index, "email", "e1").await.is_some());
    clock.advance_ms(250);

    let done = queue.finish(&job).await.unwrap();
    assert_eq!(done.status, JobStatus::Done);
    assert_eq!(done.duration, Some(250));
    assert_eq!(side_payload(&index, "email", "e1").await, None);
    assert_eq!(queue.get_metrics().jobs_succeeded, 1);
}

#[tokio::test]
async fn single_failure_retries_with_cleared_run_fields() {
    let (queue, _clock) = manual_queue();
    queue.enqueue("email", "a", json!({}), EnqueueOptions::new()).await.unwrap();
    let job = queue.dequeue_one("email").await.unwrap().unwrap();

    let outcome = queue.fail(&job, "smtp down", false).await.unwrap();
    let FailOutcome::Retried(record) = outcome else {
        panic!("first failure must retry");
    };
    assert_eq!(record.status, JobStatus::Pending);
    assert!(record.picked_at.is_none());
    assert!(record.finished_at.is_none());
    assert_eq!(record.run_history.len(), 1);
    assert_eq!(record.failed_reason.len(), 1);
    assert!(record.requeued_at.is_some());
    assert_eq!(queue.length("email").await.unwrap(), 1);

    let again = queue.dequeue_one("email").await.unwrap().unwrap();
    assert_eq!(again.attempts, 2);
}

#[tokio::test]
async fn third_failure_dead_letters() {
    let (queue, _clock, index) = indexed_queue();
    let failed = Arc::new(AtomicUsize::new(0));
    let seen = failed.clone();
    queue.on(EventKind::JobFailed, move |_event| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    queue.enqueue("email", "a", json!({}), EnqueueOptions::new()).await.unwrap();

    let mut last = None;
    for _ in 0..3 {
        let job = queue.dequeue_one("email").await.unwrap().unwrap();
        last = Some(queue.fail(&job, "boom", false).await.unwrap());
    }

    let Some(FailOutcome::DeadLettered(record)) = last else {
        panic!("third failure must dead-letter, got {last:?}");
    };
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.failed_reason.len(), 3);
    assert_eq!(queue.length("email").await.unwrap(), 0);
    assert_eq!(side_payload(&index, "email", "a").await, None);
    assert!(queue.dequeue_one("email").await.unwrap().is_none());

    let dead = queue.dead_letters("email", 0, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].identifier, "a");
    assert_eq!(failed.load(Ordering::SeqCst), 1);
    assert_eq!(queue.get_metrics().jobs_failed, 1);
}

#[tokio::test]
async fn forced_requeue_ignores_retry_budget() {
    let (queue, _clock) = manual_queue();
    let record = queue.enqueue("email", "a", json!({}), EnqueueOptions::new()).await.unwrap();
    for _ in 0..3 {
        let job = queue.dequeue_one("email").await.unwrap().unwrap();
        queue.fail(&job, "boom", false).await.unwrap();
    }

    let outcome = queue.requeue("email", record.id).await.unwrap();
    assert!(!outcome.is_dead_lettered());
    assert_eq!(outcome.record().status, JobStatus::Pending);
    assert_eq!(outcome.record().failed_reason.last().unwrap().reason, "Manually requeued");
    assert_eq!(queue.length("email").await.unwrap(), 1);
}

#[tokio::test]
async fn requeue_of_unknown_id_is_not_found() {
    let (queue, _clock) = manual_queue();
    let id: RecordId = queue.ids().generate_record_id();

    let err = queue.requeue("email", id).await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound { .. }));
}

#[tokio::test]
async fn delayed_job_becomes_due_after_its_delay() {
    let (queue, clock) = manual_queue();
    queue
        .enqueue("email", "later", json!({}), EnqueueOptions::new().delay(60_000))
        .await
        .unwrap();

    assert!(queue.dequeue_one("email").await.unwrap().is_none());
    clock.advance_ms(59_999);
    assert!(queue.dequeue_one("email").await.unwrap().is_none());
    clock.advance_ms(1);
    assert_eq!(
        queue.dequeue_one("email").await.unwrap().unwrap().identifier,
        "later"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeue_hands_a_job_to_one_caller() {
    let queue = QueueBuilder::new().with_settings(settings()).build().unwrap();
    queue.enqueue("email", "only", json!({}), EnqueueOptions::new()).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move { queue.dequeue_one("email").await }));
    }
    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap().unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn held_lock_surfaces_lock_timeout() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
    let lock = Arc::new(InMemoryLock::new(clock.clone(), ids.clone()));
    let queue = QueueBuilder::new()
        .with_clock(clock)
        .with_ids(ids)
        .with_lock(lock.clone())
        .with_settings(QueueSettings {
            lock_policy: LockPolicy {
                ttl: Duration::from_secs(1),
                retry_count: 2,
                retry_delay: Duration::from_millis(1),
            },
            ..settings()
        })
        .build()
        .unwrap();
    queue.enqueue("email", "a", json!({}), EnqueueOptions::new()).await.unwrap();

    let held = lock
        .try_acquire(&lock_key("email"), Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    let err = queue.dequeue_one("email").await.unwrap_err();
    assert!(matches!(err, QueueError::LockTimeout { attempts: 3, .. }));
    assert!(err.is_transient());

    lock.release(&held).await.unwrap();
    assert!(queue.dequeue_one("email").await.unwrap().is_some());
}

#[tokio::test]
async fn invalid_payload_writes_nothing() {
    let (queue, _clock) = manual_queue();
    queue
        .define(
            "email",
            handler_fn(|_job, _cancel| async { Ok(true) }),
            RunnerOptions::new().schema(RequiredFields::new(["to"])),
        )
        .unwrap();

    let err = queue
        .enqueue("email", "a", json!({"subject": "hi"}), EnqueueOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Validation { .. }));
    assert_eq!(queue.length("email").await.unwrap(), 0);
    assert_eq!(queue.count_in_last_hours("email", 1).await.unwrap(), 0);

    let batch = queue
        .enqueue_batch(
            "email",
            vec![
                NewJob::new("ok", json!({"to": "a@example.com"})),
                NewJob::new("bad", json!({})),
            ],
        )
        .await;
    assert!(batch.is_err());
    assert_eq!(queue.length("email").await.unwrap(), 0);

    let stored = queue
        .enqueue_batch(
            "email",
            vec![
                NewJob::new("first", json!({"to": "a@example.com"})),
                NewJob::new("urgent", json!({"to": "b@example.com"}))
                    .with_options(EnqueueOptions::new().priority(100)),
            ],
        )
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);
    let order: Vec<String> = queue
        .snapshot("email")
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.identifier)
        .collect();
    assert_eq!(order, vec!["urgent", "first"]);
}

#[tokio::test]
async fn downstream_waits_for_upstream_to_drain() {
    let (queue, _clock) = manual_queue();
    queue
        .define("ingest", handler_fn(|_job, _cancel| async { Ok(true) }), RunnerOptions::new())
        .unwrap();
    queue
        .define(
            "report",
            handler_fn(|_job, _cancel| async { Ok(true) }),
            RunnerOptions::new().depends_on("ingest"),
        )
        .unwrap();
    queue.enqueue("ingest", "i", json!({}), EnqueueOptions::new()).await.unwrap();

    assert!(matches!(
        queue.check_job_dependencies("report").await,
        Err(QueueError::DependencyPending(upstream)) if upstream == "ingest"
    ));
    queue.dequeue_one("ingest").await.unwrap().unwrap();
    assert!(queue.check_job_dependencies("report").await.is_ok());
}

#[tokio::test]
async fn repair_republishes_records_missing_from_the_index() {
    let clock = Arc::new(ManualClock::default());
    let index = Arc::new(InMemoryDispatchIndex::new());
    let queue = QueueBuilder::new()
        .with_clock(clock.clone())
        .with_index(index.clone())
        .with_settings(settings())
        .build()
        .unwrap();
    queue.enqueue("email", "a", json!({}), EnqueueOptions::new()).await.unwrap();
    queue.enqueue("email", "b", json!({}), EnqueueOptions::new()).await.unwrap();
    queue.enqueue("email", "c", json!({}), EnqueueOptions::new()).await.unwrap();
    queue.dequeue_one("email").await.unwrap().unwrap();
    // Lose an entry behind the engine's back.
    let lost = index.pop_due("email", i64::MAX, 1).await.unwrap();
    assert_eq!(queue.length("email").await.unwrap(), 1);

    assert_eq!(queue.repair_orphans("email").await.unwrap(), 1);
    assert_eq!(queue.length("email").await.unwrap(), 2);
    assert!(queue.snapshot("email").await.unwrap().iter().any(|e| e.identifier == lost[0]));
    assert_eq!(queue.repair_orphans("email").await.unwrap(), 0);

    clock.advance_ms(10);
    assert_eq!(queue.redistribute_jobs("email").await.unwrap(), 2);
    assert!(
        queue
            .snapshot("email")
            .await
            .unwrap()
            .iter()
            .all(|e| e.score == clock.now_ms())
    );
}

#[tokio::test]
async fn execution_loop_retries_until_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let queue = QueueBuilder::new()
        .with_settings(settings())
        .define(
            "flaky",
            handler_fn(move |job, _cancel: CancellationToken| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(job.attempts >= 2)
                }
            }),
            RunnerOptions::new(),
        )
        .build()
        .unwrap();
    queue.enqueue("flaky", "a", json!({}), EnqueueOptions::new()).await.unwrap();

    let exec = ExecutionLoop::new(
        queue.clone(),
        LoopSettings {
            batch_size: 5,
            parallel: false,
            poll_interval: Duration::from_millis(5),
        },
    );
    let token = CancellationToken::new();
    assert_eq!(exec.sweep(&token).await, 1);
    assert_eq!(exec.sweep(&token).await, 1);
    assert_eq!(exec.sweep(&token).await, 0);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let metrics = queue.get_metrics();
    assert_eq!(metrics.jobs_retried, 1);
    assert_eq!(metrics.jobs_succeeded, 1);

    let executed = queue
        .paginate_executed("flaky", &PageQuery { status: Some(JobStatus::Done), ..PageQuery::default() })
        .await
        .unwrap();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].run_history.len(), 1);
}
