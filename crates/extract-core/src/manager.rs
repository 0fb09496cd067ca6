//! The orchestrator: `JobManager::trigger` (§4.2).
//!
//! One call to `trigger` acquires the lease, selects or constructs a job,
//! fans tasks out under a concurrency cap, folds their progress back into
//! the job, and commits or fails the window. Everything here is built around
//! a single rule: the in-memory `Job` is only ever mutated while holding
//! `update_job_lock`, and that lock is never held across an `.await` on the
//! store.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{Clock, Config};
use crate::error::SchedulerError;
use crate::executor::{ProgressSink, ResourceTypeCatalog, TaskExecutor};
use crate::model::{DataPeriod, Job, JobStatus, TaskResult};
use crate::store::JobStore;

pub struct JobManager {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn TaskExecutor>,
    catalog: Arc<dyn ResourceTypeCatalog>,
    clock: Arc<dyn Clock>,
    config: Config,
    holder_id: String,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn TaskExecutor>,
        catalog: Arc<dyn ResourceTypeCatalog>,
        clock: Arc<dyn Clock>,
        config: Config,
        holder_id: impl Into<String>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            executor,
            catalog,
            clock,
            config,
            holder_id: holder_id.into(),
        })
    }

    /// Runs one scheduling cycle. Safe to call repeatedly and concurrently —
    /// surplus callers short-circuit on lease contention (I4).
    #[tracing::instrument(skip(self, cancel), fields(holder = %self.holder_id))]
    pub async fn trigger(&self, cancel: CancellationToken) -> Result<(), SchedulerError> {
        let acquired = self
            .store
            .acquire_lease(&self.holder_id)
            .await
            .map_err(SchedulerError::StoreUnavailable)?;
        if !acquired {
            tracing::debug!("lease unavailable, another holder is active");
            return Ok(());
        }

        let result = self.trigger_locked(cancel).await;

        if let Err(err) = self.store.release_lease(&self.holder_id).await {
            tracing::warn!(error = %err, "failed to release lease");
        }

        result
    }

    async fn trigger_locked(&self, cancel: CancellationToken) -> Result<(), SchedulerError> {
        let active = self
            .store
            .get_active_jobs()
            .await
            .map_err(SchedulerError::StoreUnavailable)?;

        let job = match active.into_iter().next() {
            Some(job) if job.status == JobStatus::Succeeded => {
                tracing::info!(job_id = %job.id, "prior run committed but was not archived, completing now");
                self.store
                    .complete_job(&job)
                    .await
                    .map_err(SchedulerError::StoreUnavailable)?;
                return Ok(());
            }
            Some(mut job) => {
                tracing::info!(job_id = %job.id, "resuming active job");
                job.status = JobStatus::Running;
                job.failed_reason = None;
                job
            }
            None => self.construct_new_job().await?,
        };

        let job_id = job.id;
        let job_state = Arc::new(Mutex::new(job));
        let fanout_result = self.run_fanout(job_state.clone(), cancel).await;

        let mut job = Arc::try_unwrap(job_state)
            .expect("fan-out joins every task and the persist writer before returning")
            .into_inner();

        match fanout_result {
            Ok(()) => {
                self.store
                    .update_job(&job)
                    .await
                    .map_err(SchedulerError::StoreUnavailable)?;
                self.store
                    .commit_job_data(&job)
                    .await
                    .map_err(SchedulerError::StoreUnavailable)?;
                job.status = JobStatus::Succeeded;
                self.store
                    .update_job(&job)
                    .await
                    .map_err(SchedulerError::StoreUnavailable)?;
                self.store
                    .complete_job(&job)
                    .await
                    .map_err(SchedulerError::StoreUnavailable)?;
                tracing::info!(job_id = %job_id, "job succeeded, watermark advanced");
                Ok(())
            }
            Err(reason) => {
                job.status = JobStatus::Failed;
                job.failed_reason = Some(reason.clone());
                if let Err(persist_err) = self.store.update_job(&job).await {
                    tracing::error!(job_id = %job_id, error = %persist_err, "failed to persist failed job state");
                }
                tracing::error!(job_id = %job_id, reason = %reason, "job failed, watermark unchanged");
                Err(SchedulerError::ExecuteTaskFailed(reason))
            }
        }
    }

    /// New-job construction (§4.2.1).
    async fn construct_new_job(&self) -> Result<Job, SchedulerError> {
        let metadata = self
            .store
            .get_scheduler_metadata()
            .await
            .map_err(SchedulerError::StoreUnavailable)?;

        let trigger_start = metadata
            .and_then(|m| m.last_scheduled_timestamp)
            .unwrap_or(self.config.start_time);

        let candidate_end = self.clock.now() - self.config.latency_margin();
        let trigger_end = match self.config.end_time {
            Some(end_time) => candidate_end.min(end_time),
            None => candidate_end,
        };

        if let Some(end_time) = self.config.end_time {
            if trigger_start >= end_time {
                return Err(SchedulerError::StartJobFailed(
                    "scheduled to end".to_string(),
                ));
            }
        }
        if trigger_start >= trigger_end {
            return Err(SchedulerError::StartJobFailed(
                "start is in the future".to_string(),
            ));
        }

        let resource_types: BTreeSet<String> = if !self.config.resource_type_filters.is_empty() {
            self.config.resource_type_filters.iter().cloned().collect()
        } else {
            self.catalog
                .get_all()
                .await
                .map_err(SchedulerError::StoreUnavailable)?
                .into_iter()
                .collect()
        };
        if resource_types.is_empty() {
            return Err(SchedulerError::StartJobFailed(
                "no resource types to extract".to_string(),
            ));
        }

        let data_period = DataPeriod::new(trigger_start, trigger_end)
            .map_err(|err| SchedulerError::StartJobFailed(err.to_string()))?;

        let job = Job::new(
            self.config.container_name.clone(),
            resource_types,
            data_period,
            self.clock.now(),
        );
        self.store
            .update_job(&job)
            .await
            .map_err(SchedulerError::StoreUnavailable)?;
        tracing::info!(
            job_id = %job.id,
            start = %job.data_period.start,
            end = %job.data_period.end,
            "constructed new job"
        );
        Ok(job)
    }

    /// Task fan-out (§4.2.2): bounded-concurrency submission, first-finish
    /// draining, and cooperative cancellation on failure.
    async fn run_fanout(
        &self,
        job_state: Arc<Mutex<Job>>,
        cancel: CancellationToken,
    ) -> Result<(), String> {
        let mut pending: VecDeque<String> = {
            let job = job_state.lock().await;
            job.resource_types
                .iter()
                .filter(|rt| !job.task_context(rt).is_completed)
                .cloned()
                .collect()
        };

        let fanout_cancel = cancel.child_token();
        let execution_token = CancellationToken::new();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<TaskResult>();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel::<Job>();
        let writer = spawn_persist_writer(self.store.clone(), persist_rx, execution_token.clone());

        type TaskOutcome = (String, anyhow::Result<TaskResult>);
        let mut joinset: JoinSet<TaskOutcome> = JoinSet::new();
        let mut failure: Option<String> = None;

        while let Some(resource_type) = pending.pop_front() {
            while failure.is_none() && joinset.len() >= self.config.max_concurrency_count {
                if let Err(reason) =
                    drain_one(&mut joinset, &mut progress_rx, &job_state, &persist_tx).await
                {
                    failure.get_or_insert(reason);
                    fanout_cancel.cancel();
                }
            }
            if failure.is_some() {
                pending.push_front(resource_type);
                break;
            }

            let context = { job_state.lock().await.task_context(&resource_type) };
            let executor = self.executor.clone();
            let progress = ProgressSink::new(progress_tx.clone());
            let task_cancel = fanout_cancel.clone();
            let rt_for_task = resource_type.clone();
            joinset.spawn(async move {
                let outcome = executor.execute(context, progress, task_cancel).await;
                (rt_for_task, outcome)
            });
        }

        if failure.is_some() {
            fanout_cancel.cancel();
        }

        while !joinset.is_empty() {
            if let Err(reason) =
                drain_one(&mut joinset, &mut progress_rx, &job_state, &persist_tx).await
            {
                failure.get_or_insert(reason);
                fanout_cancel.cancel();
            }
        }

        // Short-circuits any progress write still queued behind the writer's
        // channel without cancelling the final update_job/commit_job_data the
        // caller issues next on the outer `cancel` token.
        execution_token.cancel();
        drop(persist_tx);
        let persist_failure = writer.await.unwrap_or(None);

        // A progress write failing mid-execution is, per spec, treated the
        // same as a failed task (§7). A task failure already found takes
        // precedence in the reported reason; the persist failure still
        // surfaces if the fan-out was otherwise clean.
        match (failure, persist_failure) {
            (Some(reason), _) => Err(reason),
            (None, Some(err)) => Err(match SchedulerError::from_store_during_execution(err) {
                SchedulerError::ExecuteTaskFailed(reason) => reason,
                other => other.to_string(),
            }),
            (None, None) => Ok(()),
        }
    }
}

/// Waits for either the next terminal task result or the next progress
/// checkpoint, folds it into `job_state`, and queues a persist. Returns
/// `Err` only for a terminal task failure (checkpoints never fail the
/// fan-out).
async fn drain_one(
    joinset: &mut JoinSet<(String, anyhow::Result<TaskResult>)>,
    progress_rx: &mut mpsc::UnboundedReceiver<TaskResult>,
    job_state: &Arc<Mutex<Job>>,
    persist_tx: &mpsc::UnboundedSender<Job>,
) -> Result<(), String> {
    tokio::select! {
        joined = joinset.join_next() => {
            match joined {
                Some(Ok((_resource_type, Ok(result)))) => {
                    fold_task_result(job_state, persist_tx, result).await;
                    Ok(())
                }
                Some(Ok((resource_type, Err(err)))) => {
                    Err(format!("{resource_type}: {err:#}"))
                }
                Some(Err(join_err)) => Err(format!("executor task did not complete: {join_err}")),
                None => Ok(()),
            }
        }
        Some(checkpoint) = progress_rx.recv() => {
            fold_task_result(job_state, persist_tx, checkpoint).await;
            Ok(())
        }
    }
}

/// Applies a progress checkpoint or terminal `TaskResult` to the job under
/// `update_job_lock`, then (if it wasn't dropped for stickiness) queues the
/// resulting snapshot for a durable write. Shared by both the progress sink
/// path and the task-result fold path, since both must honor the same
/// completed-resource stickiness rule (I2/P4).
async fn fold_task_result(
    job_state: &Arc<Mutex<Job>>,
    persist_tx: &mpsc::UnboundedSender<Job>,
    result: TaskResult,
) {
    let snapshot = {
        let mut job = job_state.lock().await;
        if job.completed_resources.contains(&result.resource_type) {
            tracing::debug!(
                resource_type = %result.resource_type,
                "dropping late update for already-completed resource"
            );
            None
        } else {
            if result.is_completed {
                job.completed_resources.insert(result.resource_type.clone());
            }
            let state = job.resources.entry(result.resource_type.clone()).or_default();
            state.progress = result.progress;
            state.total_count = result.total_count;
            state.processed_count = result.processed_count;
            state.skipped_count = result.skipped_count;
            state.part_id = result.part_id;
            Some(job.clone())
        }
    };

    if let Some(snapshot) = snapshot {
        let _ = persist_tx.send(snapshot);
    }
}

/// Serializes durable writes triggered by progress/task-result folds so that
/// `update_job_lock` is never held across store I/O. Stops issuing writes
/// (but keeps draining the channel to let it close) once `execution_token`
/// fires, so late progress from cancelled tasks never races the final
/// commit.
///
/// Returns the first `update_job` failure observed, if any, so the caller
/// can fold a store failure mid-execution into the fan-out's result (§7:
/// `StoreUnavailable` observed mid-execution is treated as
/// `ExecuteTaskFailed`) instead of only logging and dropping it.
fn spawn_persist_writer(
    store: Arc<dyn JobStore>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    execution_token: CancellationToken,
) -> tokio::task::JoinHandle<Option<anyhow::Error>> {
    tokio::spawn(async move {
        let mut first_error = None;
        while let Some(job) = rx.recv().await {
            if execution_token.is_cancelled() {
                continue;
            }
            if let Err(err) = store.update_job(&job).await {
                tracing::warn!(job_id = %job.id, error = %err, "progress persist failed");
                first_error.get_or_insert(err);
            }
        }
        first_error
    })
}
