//! Durable data model for an extraction job.
//!
//! [`Job`] is the only thing the scheduler persists per in-flight window; every
//! other type here is either a view onto a `Job` (`TaskContext`) or a terminal
//! report folded back into one (`TaskResult`).

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque pagination cursor for one resource type.
///
/// Distinguishes "never started" from "fully drained" at the type level,
/// rather than overloading `Option<String>` and relying on an empty-string
/// convention for the former.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceProgress {
    NotStarted,
    InProgress(String),
    Drained,
}

impl ResourceProgress {
    pub fn is_drained(&self) -> bool {
        matches!(self, ResourceProgress::Drained)
    }

    pub fn continuation_token(&self) -> Option<&str> {
        match self {
            ResourceProgress::InProgress(token) => Some(token.as_str()),
            ResourceProgress::NotStarted | ResourceProgress::Drained => None,
        }
    }
}

impl Default for ResourceProgress {
    fn default() -> Self {
        ResourceProgress::NotStarted
    }
}

/// Half-open interval `[start, end)` of source-record timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DataPeriod {
    /// Enforces invariant I3 (`start < end`) at construction so an invalid
    /// period can never be persisted.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> anyhow::Result<Self> {
        anyhow::ensure!(start < end, "data period start {start} must precede end {end}");
        Ok(Self { start, end })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    New,
    Running,
    Succeeded,
    Failed,
}

/// Per-resource-type bookkeeping carried on a [`Job`].
///
/// Mirrors the four progress fields the spec keys by resource type; grouped
/// into one struct so the progress sink and the task-result fold overwrite
/// all of them atomically under the same lock acquisition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceState {
    pub progress: ResourceProgress,
    pub total_count: Option<u64>,
    pub processed_count: u64,
    pub skipped_count: u64,
    pub part_id: u64,
}

/// One in-flight (or archived) extraction window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub container_name: String,
    pub status: JobStatus,
    pub resource_types: BTreeSet<String>,
    pub data_period: DataPeriod,
    pub created_at: DateTime<Utc>,
    pub completed_resources: BTreeSet<String>,
    pub resources: HashMap<String, ResourceState>,
    pub failed_reason: Option<String>,
}

impl Job {
    pub fn new(
        container_name: String,
        resource_types: BTreeSet<String>,
        data_period: DataPeriod,
        created_at: DateTime<Utc>,
    ) -> Self {
        let resources = resource_types
            .iter()
            .cloned()
            .map(|rt| (rt, ResourceState::default()))
            .collect();
        Self {
            id: Uuid::new_v4(),
            container_name,
            status: JobStatus::New,
            resource_types,
            data_period,
            created_at,
            completed_resources: BTreeSet::new(),
            resources,
            failed_reason: None,
        }
    }

    /// Builds the in-memory work descriptor a `TaskExecutor` resumes from.
    ///
    /// `is_completed` is derived rather than stored: true if the resource is
    /// already in `completed_resources`, or its progress cursor is drained.
    pub fn task_context(&self, resource_type: &str) -> TaskContext {
        let state = self.resources.get(resource_type).cloned().unwrap_or_default();
        let is_completed = self.completed_resources.contains(resource_type)
            || state.progress.is_drained();
        TaskContext {
            resource_type: resource_type.to_string(),
            continuation_token: state.progress.continuation_token().map(str::to_string),
            search_count: state.total_count,
            processed_count: state.processed_count,
            skipped_count: state.skipped_count,
            part_id: state.part_id,
            is_completed,
        }
    }
}

/// Process-wide durable state outside any `Job`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerMetadata {
    pub last_scheduled_timestamp: Option<DateTime<Utc>>,
}

/// In-memory per-resource work descriptor handed to a `TaskExecutor`.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub resource_type: String,
    pub continuation_token: Option<String>,
    pub search_count: Option<u64>,
    pub processed_count: u64,
    pub skipped_count: u64,
    pub part_id: u64,
    pub is_completed: bool,
}

/// Terminal report from one task, folded back into the owning `Job`.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub resource_type: String,
    pub progress: ResourceProgress,
    pub total_count: Option<u64>,
    pub processed_count: u64,
    pub skipped_count: u64,
    pub part_id: u64,
    pub is_completed: bool,
}

impl TaskResult {
    /// Builds a progress-only report for use from a `ProgressSink` checkpoint;
    /// never carries `is_completed = true` on its own.
    pub fn checkpoint(context: &TaskContext) -> Self {
        Self {
            resource_type: context.resource_type.clone(),
            progress: match &context.continuation_token {
                Some(token) => ResourceProgress::InProgress(token.clone()),
                None => ResourceProgress::NotStarted,
            },
            total_count: context.search_count,
            processed_count: context.processed_count,
            skipped_count: context.skipped_count,
            part_id: context.part_id,
            is_completed: false,
        }
    }
}
