//! Failure kinds surfaced by [`crate::manager::JobManager::trigger`].
//!
//! `LeaseUnavailable` never leaves this crate as an `Err` — it is logged and
//! swallowed at the point `trigger` checks the lease. It is still a variant
//! here so internal plumbing can match on it uniformly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("lease unavailable, another holder is active")]
    LeaseUnavailable,

    #[error("could not start a new job: {0}")]
    StartJobFailed(String),

    #[error("task execution failed: {0}")]
    ExecuteTaskFailed(String),

    #[error("job store unavailable")]
    StoreUnavailable(#[source] anyhow::Error),
}

impl SchedulerError {
    /// Wraps a store-layer `anyhow::Error` observed mid-execution (e.g. a
    /// progress persist failing in the fan-out's writer task), where the
    /// spec treats it identically to a failed task. Used by
    /// `manager::run_fanout` to fold a persist-writer failure into the same
    /// `ExecuteTaskFailed` outcome a task failure produces.
    pub fn from_store_during_execution(err: anyhow::Error) -> Self {
        SchedulerError::ExecuteTaskFailed(format!("store unavailable: {err}"))
    }
}
