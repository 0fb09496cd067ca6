//! The `JobStore` contract (§4.1): durable state the core depends on but does
//! not implement. `extract-store-postgres` provides the production
//! implementation; `extract-testing` provides an in-memory fake.

use async_trait::async_trait;

use crate::model::{Job, SchedulerMetadata};

/// Advisory, TTL-bound exclusive lease plus the job/metadata archive the
/// scheduler depends on. Every operation is failable with an opaque
/// `anyhow::Error` — the orchestrator only needs to know *that* the store
/// failed, not the I/O-level reason, matching the teacher's own
/// store-facing traits.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Attempts to acquire the lease for `holder_id`. Returns `true` iff no
    /// other holder currently owns it. Non-blocking: never waits out a
    /// competing holder's TTL.
    async fn acquire_lease(&self, holder_id: &str) -> anyhow::Result<bool>;

    /// Idempotent; safe to call when `holder_id` does not currently hold the
    /// lease.
    async fn release_lease(&self, holder_id: &str) -> anyhow::Result<()>;

    async fn get_scheduler_metadata(&self) -> anyhow::Result<Option<SchedulerMetadata>>;

    /// Ordered sequence of jobs in `{New, Running, Failed}`. The caller
    /// treats the first element as "the" active job and relies on at most
    /// one such job existing at a time (invariant I4).
    async fn get_active_jobs(&self) -> anyhow::Result<Vec<Job>>;

    /// Atomic snapshot write of the full job record.
    async fn update_job(&self, job: &Job) -> anyhow::Result<()>;

    /// Archives `job` into the completed or failed namespace (by its
    /// `status`) and removes it from the active set. Must be idempotent:
    /// calling it again on an already-archived job is a no-op, not an error
    /// — the crash-recovery branch in `JobManager::trigger` depends on this.
    async fn complete_job(&self, job: &Job) -> anyhow::Result<()>;

    /// Finalizes output parts for `job`'s window and atomically advances
    /// `SchedulerMetadata::last_scheduled_timestamp` to `job.data_period.end`.
    /// Must be idempotent: re-invocation after a crash either completes the
    /// commit or leaves no partial effect.
    async fn commit_job_data(&self, job: &Job) -> anyhow::Result<()>;
}
