//! End-to-end scenarios from the design doc (§8), driven against the
//! in-memory fakes in `extract-testing` rather than a real source server or
//! object store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use extract_core::{Clock, Config, JobManager, JobStatus, JobStore, ResourceProgress};
use extract_testing::{FixedClock, InMemoryJobStore, ScriptedExecutor, ScriptedStep, StaticCatalog};
use tokio_util::sync::CancellationToken;

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn config(start: &str, end: Option<&str>, filters: &[&str], concurrency: usize) -> Config {
    Config {
        start_time: ts(start),
        end_time: end.map(ts),
        container_name: "fhir-export".to_string(),
        resource_type_filters: filters.iter().map(|s| s.to_string()).collect(),
        max_concurrency_count: concurrency,
        job_query_latency_minutes: 2,
    }
}

/// Scenario 1: cold start, small window, both executors drain in one page.
#[tokio::test]
async fn cold_start_small_window_succeeds() {
    let store = Arc::new(InMemoryJobStore::new());
    let clock = Arc::new(FixedClock::new(ts("2024-01-01T02:00:00Z")));
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_script("A", vec![ScriptedStep::final_page(10)])
            .with_script("B", vec![ScriptedStep::final_page(20)]),
    );
    let catalog = Arc::new(StaticCatalog::new(["A", "B"]));
    let cfg = config("2024-01-01T00:00:00Z", Some("2024-01-01T01:00:00Z"), &["A", "B"], 2);

    let manager = JobManager::new(store.clone(), executor, catalog, clock, cfg, "holder-1").unwrap();
    manager.trigger(CancellationToken::new()).await.unwrap();

    let completed = store.completed_jobs().await;
    assert_eq!(completed.len(), 1);
    let job = &completed[0];
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.data_period.start, ts("2024-01-01T00:00:00Z"));
    assert_eq!(job.data_period.end, ts("2024-01-01T01:00:00Z"));
    assert_eq!(
        job.completed_resources,
        ["A".to_string(), "B".to_string()].into_iter().collect()
    );

    let metadata = store.metadata().await.unwrap();
    assert_eq!(metadata.last_scheduled_timestamp, Some(ts("2024-01-01T01:00:00Z")));
    assert!(store.active_jobs().await.is_empty());
    assert!(store.lease_holder().await.is_none());
}

/// Scenario 2: an open-ended window is truncated by the latency margin.
#[tokio::test]
async fn latency_margin_truncates_open_ended_window() {
    let store = Arc::new(InMemoryJobStore::new());
    let clock = Arc::new(FixedClock::new(ts("2024-01-01T00:05:00Z")));
    let executor = Arc::new(ScriptedExecutor::new().with_script("A", vec![ScriptedStep::final_page(1)]));
    let catalog = Arc::new(StaticCatalog::new(["A"]));
    let cfg = config("2024-01-01T00:00:00Z", None, &["A"], 1);

    let manager = JobManager::new(store.clone(), executor, catalog, clock, cfg, "holder-1").unwrap();
    manager.trigger(CancellationToken::new()).await.unwrap();

    let completed = store.completed_jobs().await;
    assert_eq!(completed[0].data_period.end, ts("2024-01-01T00:03:00Z"));
}

/// Scenario 3: a start time past the configured horizon fails without
/// persisting any job.
#[tokio::test]
async fn start_in_the_future_fails_without_persisting() {
    let store = Arc::new(InMemoryJobStore::new());
    let clock = Arc::new(FixedClock::new(ts("2024-01-01T00:00:00Z")));
    let executor = Arc::new(ScriptedExecutor::new());
    let catalog = Arc::new(StaticCatalog::new(["A"]));
    let cfg = config("2030-01-01T00:00:00Z", None, &["A"], 1);

    let manager = JobManager::new(store.clone(), executor, catalog, clock, cfg, "holder-1").unwrap();
    let result = manager.trigger(CancellationToken::new()).await;

    assert!(matches!(result, Err(extract_core::SchedulerError::StartJobFailed(_))));
    assert!(store.active_jobs().await.is_empty());
    assert!(store.completed_jobs().await.is_empty());
    assert!(store.lease_holder().await.is_none());
}

/// Scenario 4: one resource type fails mid-pagination. The job is
/// persisted `Failed`, the watermark does not move, and the surviving
/// resource type's last progress checkpoint is retained.
#[tokio::test]
async fn task_failure_persists_failed_job_without_advancing_watermark() {
    let store = Arc::new(InMemoryJobStore::new());
    let clock = Arc::new(FixedClock::new(ts("2024-01-01T02:00:00Z")));
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_script(
                "A",
                vec![ScriptedStep::page("a-tok-1", 5), ScriptedStep::final_page(5)],
            )
            .with_script(
                "B",
                vec![ScriptedStep::page("b-tok-1", 3), ScriptedStep::fail("upstream 500 on page 2")],
            ),
    );
    let catalog = Arc::new(StaticCatalog::new(["A", "B"]));
    let cfg = config("2024-01-01T00:00:00Z", Some("2024-01-01T01:00:00Z"), &["A", "B"], 2);

    let manager = JobManager::new(store.clone(), executor, catalog, clock, cfg, "holder-1").unwrap();
    let result = manager.trigger(CancellationToken::new()).await;

    assert!(matches!(result, Err(extract_core::SchedulerError::ExecuteTaskFailed(_))));

    let active = store.active_jobs().await;
    assert_eq!(active.len(), 1);
    let job = &active[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.failed_reason.as_ref().unwrap().contains("upstream 500"));

    assert!(store.metadata().await.is_none());
    assert!(store.lease_holder().await.is_none());
}

/// Scenario 5: a crash between `commit_job_data` and `complete_job` is
/// recovered on the next trigger without opening a new window.
#[tokio::test]
async fn crash_between_commit_and_complete_is_recovered() {
    let store = Arc::new(InMemoryJobStore::new());
    let clock = Arc::new(FixedClock::new(ts("2024-01-01T02:00:00Z")));

    let mut job = extract_core::Job::new(
        "fhir-export".to_string(),
        ["A".to_string()].into_iter().collect(),
        extract_core::DataPeriod::new(ts("2024-01-01T00:00:00Z"), ts("2024-01-01T01:00:00Z")).unwrap(),
        clock.now(),
    );
    job.status = JobStatus::Succeeded;
    job.completed_resources.insert("A".to_string());
    store.seed_active_job(job).await;
    store
        .seed_watermark(ts("2024-01-01T01:00:00Z"))
        .await;

    let executor = Arc::new(ScriptedExecutor::new());
    let catalog = Arc::new(StaticCatalog::new(["A"]));
    let cfg = config("2024-01-01T00:00:00Z", Some("2024-01-01T03:00:00Z"), &["A"], 1);

    let manager = JobManager::new(store.clone(), executor, catalog, clock, cfg, "holder-1").unwrap();
    manager.trigger(CancellationToken::new()).await.unwrap();

    assert!(store.active_jobs().await.is_empty());
    assert_eq!(store.completed_jobs().await.len(), 1);
}

/// Scenario 6: resuming mid-pagination replays from the persisted
/// continuation token instead of restarting the resource type.
#[tokio::test]
async fn resumes_mid_pagination_from_persisted_continuation_token() {
    let store = Arc::new(InMemoryJobStore::new());
    let clock = Arc::new(FixedClock::new(ts("2024-01-01T02:00:00Z")));

    let mut job = extract_core::Job::new(
        "fhir-export".to_string(),
        ["A".to_string()].into_iter().collect(),
        extract_core::DataPeriod::new(ts("2024-01-01T00:00:00Z"), ts("2024-01-01T01:00:00Z")).unwrap(),
        clock.now(),
    );
    job.status = JobStatus::Running;
    job.resources.get_mut("A").unwrap().progress = ResourceProgress::InProgress("tok1".to_string());
    job.resources.get_mut("A").unwrap().processed_count = 5;
    store.seed_active_job(job).await;

    let executor = Arc::new(
        ScriptedExecutor::new().with_script(
            "A",
            vec![ScriptedStep::page("tok1", 5), ScriptedStep::final_page(5)],
        ),
    );
    let catalog = Arc::new(StaticCatalog::new(["A"]));
    let cfg = config("2024-01-01T00:00:00Z", Some("2024-01-01T01:00:00Z"), &["A"], 1);

    let manager = JobManager::new(store.clone(), executor, catalog, clock, cfg, "holder-1").unwrap();
    manager.trigger(CancellationToken::new()).await.unwrap();

    let completed = store.completed_jobs().await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].resources["A"].processed_count, 10);
    assert_eq!(store.metadata().await.unwrap().last_scheduled_timestamp, Some(ts("2024-01-01T01:00:00Z")));
}

/// P1: a second concurrent trigger against the same store, while the first
/// holds the lease, short-circuits instead of reaching the fan-out.
#[tokio::test]
async fn lease_contention_short_circuits_the_second_caller() {
    let store = Arc::new(InMemoryJobStore::new());
    assert!(store.acquire_lease("holder-1").await.unwrap());

    let clock = Arc::new(FixedClock::new(ts("2024-01-01T02:00:00Z")));
    let executor = Arc::new(ScriptedExecutor::new().with_script("A", vec![ScriptedStep::final_page(1)]));
    let catalog = Arc::new(StaticCatalog::new(["A"]));
    let cfg = config("2024-01-01T00:00:00Z", Some("2024-01-01T01:00:00Z"), &["A"], 1);

    let manager = JobManager::new(store.clone(), executor, catalog, clock, cfg, "holder-2").unwrap();
    manager.trigger(CancellationToken::new()).await.unwrap();

    // holder-2 never acquired the lease, so no job was ever constructed.
    assert!(store.active_jobs().await.is_empty());
    assert!(store.completed_jobs().await.is_empty());
    assert_eq!(store.lease_holder().await.as_deref(), Some("holder-1"));
}

/// P4: once a resource type is marked completed, a late progress callback
/// for it must not resurrect or mutate its fields.
#[tokio::test]
async fn completed_resource_state_is_sticky_against_late_progress() {
    let store = Arc::new(InMemoryJobStore::new());
    let clock = Arc::new(FixedClock::new(ts("2024-01-01T02:00:00Z")));

    // B finishes in one page; A reports a checkpoint after B is already
    // marked complete, then finishes. The fold must never let A's late
    // checkpoint appear to retouch B.
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_script("A", vec![ScriptedStep::page("a-tok", 1), ScriptedStep::final_page(1)])
            .with_script("B", vec![ScriptedStep::final_page(1)]),
    );
    let catalog = Arc::new(StaticCatalog::new(["A", "B"]));
    let cfg = config("2024-01-01T00:00:00Z", Some("2024-01-01T01:00:00Z"), &["A", "B"], 2);

    let manager = JobManager::new(store.clone(), executor, catalog, clock, cfg, "holder-1").unwrap();
    manager.trigger(CancellationToken::new()).await.unwrap();

    let completed = store.completed_jobs().await;
    assert_eq!(completed[0].completed_resources.len(), 2);
    assert_eq!(completed[0].resources["B"].processed_count, 1);
}

/// P6: the fan-out never runs more executor calls concurrently than
/// `max_concurrency_count`, even with more resource types than the cap.
#[tokio::test]
async fn concurrency_cap_bounds_in_flight_executor_calls() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let store = Arc::new(InMemoryJobStore::new());
    let clock = Arc::new(FixedClock::new(ts("2024-01-01T02:00:00Z")));

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));

    struct CountingExecutor {
        in_flight: Arc<AtomicUsize>,
        max_observed: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl extract_core::TaskExecutor for CountingExecutor {
        async fn execute(
            &self,
            context: extract_core::TaskContext,
            _progress: extract_core::ProgressSink,
            _cancel: CancellationToken,
        ) -> anyhow::Result<extract_core::TaskResult> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(extract_core::TaskResult {
                resource_type: context.resource_type,
                progress: ResourceProgress::Drained,
                total_count: None,
                processed_count: 1,
                skipped_count: 0,
                part_id: 1,
                is_completed: true,
            })
        }
    }

    let executor = Arc::new(CountingExecutor {
        in_flight: in_flight.clone(),
        max_observed: max_observed.clone(),
    });
    let catalog = Arc::new(StaticCatalog::new(["A", "B", "C", "D", "E"]));
    let cfg = config(
        "2024-01-01T00:00:00Z",
        Some("2024-01-01T01:00:00Z"),
        &["A", "B", "C", "D", "E"],
        2,
    );

    let manager = JobManager::new(store.clone(), executor, catalog, clock, cfg, "holder-1").unwrap();
    manager.trigger(CancellationToken::new()).await.unwrap();

    assert!(max_observed.load(Ordering::SeqCst) <= 2);
    assert_eq!(store.completed_jobs().await[0].completed_resources.len(), 5);
}

/// P7: when the outer cancel token fires mid-pagination, the executor
/// observes it within one more page instead of running to completion, and
/// the job is persisted reflecting only the progress made before the signal.
#[tokio::test]
async fn outer_cancel_is_observed_within_one_pagination_page() {
    let store = Arc::new(InMemoryJobStore::new());
    let clock = Arc::new(FixedClock::new(ts("2024-01-01T02:00:00Z")));

    let cancel = CancellationToken::new();
    let cancel_for_hook = cancel.clone();
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_script(
                "A",
                vec![
                    ScriptedStep::page("tok1", 1),
                    ScriptedStep::page("tok2", 1),
                    ScriptedStep::final_page(1),
                ],
            )
            .with_checkpoint_hook(move |_ctx| cancel_for_hook.cancel()),
    );
    let catalog = Arc::new(StaticCatalog::new(["A"]));
    let cfg = config("2024-01-01T00:00:00Z", Some("2024-01-01T01:00:00Z"), &["A"], 1);

    let manager = JobManager::new(store.clone(), executor, catalog, clock, cfg, "holder-1").unwrap();
    let result = manager.trigger(cancel).await;

    assert!(matches!(result, Err(extract_core::SchedulerError::ExecuteTaskFailed(_))));

    let active = store.active_jobs().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].status, JobStatus::Failed);
    // At most the first page's checkpoint landed before cancellation was
    // observed (whether it landed at all is a benign race between the
    // checkpoint fold and the terminal error fold; either way pagination
    // never reached the second or third scripted page, whose combined
    // count would be 2).
    assert!(active[0].resources["A"].processed_count <= 1);
    assert!(store.metadata().await.is_none());
}

/// Ambient-stack test: a failed fan-out emits an `error`-level event naming
/// the resource type that failed, not just a bare `Err` return.
#[tokio::test]
async fn failed_fanout_logs_an_error_event_naming_the_resource_type() {
    use std::sync::Mutex as StdMutex;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct CapturingWriter(Arc<StdMutex<Vec<u8>>>);

    impl std::io::Write for CapturingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturingWriter {
        type Writer = CapturingWriter;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    let buffer = CapturingWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_ansi(false)
        .finish();

    let store = Arc::new(InMemoryJobStore::new());
    let clock = Arc::new(FixedClock::new(ts("2024-01-01T02:00:00Z")));
    let executor = Arc::new(
        ScriptedExecutor::new().with_script("B", vec![ScriptedStep::fail("upstream 500 on page 2")]),
    );
    let catalog = Arc::new(StaticCatalog::new(["B"]));
    let cfg = config("2024-01-01T00:00:00Z", Some("2024-01-01T01:00:00Z"), &["B"], 1);
    let manager = JobManager::new(store, executor, catalog, clock, cfg, "holder-1").unwrap();

    let _guard = tracing::subscriber::set_default(subscriber);
    let _ = manager.trigger(CancellationToken::new()).await;
    drop(_guard);

    let logged = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
    assert!(logged.contains("ERROR"), "expected an error-level event, got:\n{logged}");
    assert!(logged.contains('B'), "expected the failing resource type in the log, got:\n{logged}");
}
