//! In-memory fakes for `extract-core`'s collaborator traits.
//!
//! Mirrors the teacher's `seesaw-testing` crate: a dedicated testing crate
//! rather than `#[cfg(test)]` fixtures duplicated in every consumer, so the
//! same fakes back both `extract-core`'s own integration tests and, later,
//! any host application's tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use extract_core::{
    Clock, Job, JobStatus, JobStore, ProgressSink, ResourceProgress, ResourceTypeCatalog,
    SchedulerMetadata, TaskContext, TaskExecutor, TaskResult,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// In-memory `JobStore`. Single-process, not crash-safe by construction —
/// that's the point: it lets tests simulate "crash between commit and
/// complete" by calling the two operations separately and inspecting state
/// in between, something a real store would hide behind a single process
/// lifetime.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    active: Vec<Job>,
    completed: Vec<Job>,
    failed: Vec<Job>,
    metadata: Option<SchedulerMetadata>,
    lease_holder: Option<String>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with scheduler metadata as if a prior window had
    /// already committed — used by tests that want to start from a
    /// non-zero watermark rather than `Config::start_time`.
    pub async fn seed_watermark(&self, last_scheduled_timestamp: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.metadata = Some(SchedulerMetadata {
            last_scheduled_timestamp: Some(last_scheduled_timestamp),
        });
    }

    /// Seeds an active job directly, bypassing `JobManager`, to simulate
    /// resuming after a crash mid-pagination.
    pub async fn seed_active_job(&self, job: Job) {
        let mut state = self.state.lock().await;
        state.active.push(job);
    }

    pub async fn active_jobs(&self) -> Vec<Job> {
        self.state.lock().await.active.clone()
    }

    pub async fn completed_jobs(&self) -> Vec<Job> {
        self.state.lock().await.completed.clone()
    }

    pub async fn failed_jobs(&self) -> Vec<Job> {
        self.state.lock().await.failed.clone()
    }

    pub async fn metadata(&self) -> Option<SchedulerMetadata> {
        self.state.lock().await.metadata.clone()
    }

    pub async fn lease_holder(&self) -> Option<String> {
        self.state.lock().await.lease_holder.clone()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn acquire_lease(&self, holder_id: &str) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        match &state.lease_holder {
            None => {
                state.lease_holder = Some(holder_id.to_string());
                Ok(true)
            }
            Some(current) if current == holder_id => Ok(true),
            Some(_) => Ok(false),
        }
    }

    async fn release_lease(&self, holder_id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.lease_holder.as_deref() == Some(holder_id) {
            state.lease_holder = None;
        }
        Ok(())
    }

    async fn get_scheduler_metadata(&self) -> anyhow::Result<Option<SchedulerMetadata>> {
        Ok(self.state.lock().await.metadata.clone())
    }

    async fn get_active_jobs(&self) -> anyhow::Result<Vec<Job>> {
        Ok(self.state.lock().await.active.clone())
    }

    async fn update_job(&self, job: &Job) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        match state.active.iter_mut().find(|existing| existing.id == job.id) {
            Some(existing) => *existing = job.clone(),
            None => state.active.push(job.clone()),
        }
        Ok(())
    }

    async fn complete_job(&self, job: &Job) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.active.retain(|existing| existing.id != job.id);

        let archive = match job.status {
            JobStatus::Succeeded => &mut state.completed,
            JobStatus::Failed => &mut state.failed,
            other => anyhow::bail!("cannot archive a job with status {other:?}"),
        };
        if !archive.iter().any(|existing| existing.id == job.id) {
            archive.push(job.clone());
        }
        Ok(())
    }

    async fn commit_job_data(&self, job: &Job) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let end = job.data_period.end;
        let advanced = match state.metadata.as_ref().and_then(|m| m.last_scheduled_timestamp) {
            Some(current) if current >= end => current,
            _ => end,
        };
        state.metadata = Some(SchedulerMetadata {
            last_scheduled_timestamp: Some(advanced),
        });
        Ok(())
    }
}

/// Settable clock so latency-margin and horizon tests don't race a real one.
pub struct FixedClock(StdMutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(StdMutex::new(now))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().expect("fixed clock mutex poisoned") = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().expect("fixed clock mutex poisoned")
    }
}

/// `ResourceTypeCatalog` fake returning a fixed list.
pub struct StaticCatalog(Vec<String>);

impl StaticCatalog {
    pub fn new<I, S>(resource_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(resource_types.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl ResourceTypeCatalog for StaticCatalog {
    async fn get_all(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// One simulated upstream page, or a scripted failure, in a resource type's
/// pagination sequence.
#[derive(Clone)]
pub enum ScriptedStep {
    Page {
        /// The continuation token the upstream would hand back after this
        /// page. `None` means pagination is exhausted.
        next_token: Option<String>,
        processed: u64,
        skipped: u64,
        total: Option<u64>,
    },
    Fail(String),
}

impl ScriptedStep {
    pub fn page(next_token: impl Into<String>, processed: u64) -> Self {
        ScriptedStep::Page {
            next_token: Some(next_token.into()),
            processed,
            skipped: 0,
            total: None,
        }
    }

    pub fn final_page(processed: u64) -> Self {
        ScriptedStep::Page {
            next_token: None,
            processed,
            skipped: 0,
            total: None,
        }
    }

    pub fn with_total(self, total: u64) -> Self {
        match self {
            ScriptedStep::Page {
                next_token,
                processed,
                skipped,
                ..
            } => ScriptedStep::Page {
                next_token,
                processed,
                skipped,
                total: Some(total),
            },
            fail => fail,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        ScriptedStep::Fail(message.into())
    }
}

type CheckpointHook = Arc<dyn Fn(&TaskContext) + Send + Sync>;

/// `TaskExecutor` fake that replays a scripted pagination sequence per
/// resource type, resuming from whatever continuation token the `TaskContext`
/// carries rather than always starting at step zero — the same resumption
/// contract a real executor must honor.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    scripts: HashMap<String, Vec<ScriptedStep>>,
    on_checkpoint: Option<CheckpointHook>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, resource_type: impl Into<String>, steps: Vec<ScriptedStep>) -> Self {
        self.scripts.insert(resource_type.into(), steps);
        self
    }

    /// Invoked synchronously after every non-terminal progress checkpoint.
    /// Tests use this to fire a trigger's outer cancellation token mid-
    /// pagination and assert the executor observes it within one more page
    /// (P7: cancellation promptness) rather than running to completion.
    pub fn with_checkpoint_hook(mut self, hook: impl Fn(&TaskContext) + Send + Sync + 'static) -> Self {
        self.on_checkpoint = Some(Arc::new(hook));
        self
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        context: TaskContext,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> anyhow::Result<TaskResult> {
        let steps = self
            .scripts
            .get(&context.resource_type)
            .cloned()
            .unwrap_or_default();

        let start_idx = match &context.continuation_token {
            None => 0,
            Some(token) => steps
                .iter()
                .position(|step| matches!(step, ScriptedStep::Page { next_token: Some(t), .. } if t == token))
                .map(|i| i + 1)
                .unwrap_or(0),
        };

        let mut processed = context.processed_count;
        let mut skipped = context.skipped_count;
        let mut part_id = context.part_id;
        let mut total = context.search_count;

        for step in &steps[start_idx..] {
            if cancel.is_cancelled() {
                anyhow::bail!(
                    "cancelled mid-pagination for resource type {}",
                    context.resource_type
                );
            }

            match step {
                ScriptedStep::Fail(message) => anyhow::bail!(message.clone()),
                ScriptedStep::Page {
                    next_token,
                    processed: page_processed,
                    skipped: page_skipped,
                    total: page_total,
                } => {
                    processed += page_processed;
                    skipped += page_skipped;
                    part_id += 1;
                    if page_total.is_some() {
                        total = *page_total;
                    }

                    if let Some(token) = next_token {
                        let checkpoint = TaskContext {
                            resource_type: context.resource_type.clone(),
                            continuation_token: Some(token.clone()),
                            search_count: total,
                            processed_count: processed,
                            skipped_count: skipped,
                            part_id,
                            is_completed: false,
                        };
                        progress.report(&checkpoint);
                        if let Some(hook) = &self.on_checkpoint {
                            hook(&checkpoint);
                        }
                    } else {
                        return Ok(TaskResult {
                            resource_type: context.resource_type.clone(),
                            progress: ResourceProgress::Drained,
                            total_count: total,
                            processed_count: processed,
                            skipped_count: skipped,
                            part_id,
                            is_completed: true,
                        });
                    }
                }
            }
        }

        let progress_state = match steps.last() {
            Some(ScriptedStep::Page {
                next_token: Some(token),
                ..
            }) => ResourceProgress::InProgress(token.clone()),
            _ => ResourceProgress::NotStarted,
        };
        Ok(TaskResult {
            resource_type: context.resource_type.clone(),
            progress: progress_state,
            total_count: total,
            processed_count: processed,
            skipped_count: skipped,
            part_id,
            is_completed: false,
        })
    }
}
