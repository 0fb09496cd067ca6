//! External collaborator contracts: the per-resource worker (§4.3) and the
//! resource-type enumerator (§4.4).

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::{TaskContext, TaskResult};

/// Handed to a `TaskExecutor` so it can report progress at each pagination
/// checkpoint without knowing anything about how (or whether) that progress
/// gets persisted. Backed by an unbounded channel so a slow persistence path
/// never blocks the executor's pagination loop.
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<TaskResult>,
}

impl ProgressSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<TaskResult>) -> Self {
        Self { tx }
    }

    /// Reports a mid-pagination checkpoint. Silently dropped if the fan-out
    /// has already finished draining this task's channel (e.g. the owning
    /// task already returned its terminal result).
    pub fn report(&self, context: &TaskContext) {
        let _ = self.tx.send(TaskResult::checkpoint(context));
    }
}

/// Drives one resource type to completion.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Resumes from `context.continuation_token`, reports progress via
    /// `progress` at each page, and returns a terminal `TaskResult` whose
    /// `is_completed` is true iff upstream pagination is exhausted.
    ///
    /// On cancellation, must return promptly; the fan-out treats a
    /// cancelled task as a failed one and decides whether to surface it.
    async fn execute(
        &self,
        context: TaskContext,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> anyhow::Result<TaskResult>;
}

/// Enumerates every resource type known to the schema catalog, consulted
/// only when `Config::resource_type_filters` is empty.
#[async_trait]
pub trait ResourceTypeCatalog: Send + Sync {
    async fn get_all(&self) -> anyhow::Result<Vec<String>>;
}
