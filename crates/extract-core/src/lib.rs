//! # extract-core
//!
//! Job scheduler and task coordinator for incremental, windowed extraction
//! of healthcare resource data from a typed-record source server into
//! columnar object-store output.
//!
//! ## Architecture
//!
//! ```text
//! host timer
//!     │
//!     ▼ trigger(cancel)
//! JobManager
//!     │
//!     ├─► acquire_lease ──────────────► JobStore
//!     ├─► select or construct Job ────► JobStore
//!     │
//!     ├─► per resource type ──► TaskExecutor::execute ──► ProgressSink
//!     │        (bounded concurrency, JoinSet)                  │
//!     │                                                        ▼
//!     │                                              fold under update_job_lock
//!     │                                                        │
//!     │                                                        ▼
//!     │                                           persist writer ──► JobStore
//!     │
//!     └─► commit_job_data / complete_job ─────────► JobStore
//! ```
//!
//! ## Core invariants
//!
//! 1. **At most one active job** — enforced by the JobStore lease (I4).
//! 2. **Completed resources are sticky** — a progress callback or task
//!    result for an already-completed resource type is dropped, never
//!    mutates state again (I2).
//! 3. **Watermark advances only on success** — `commit_job_data` is the only
//!    place `SchedulerMetadata::last_scheduled_timestamp` moves, and only
//!    after every task has a terminal result (I5).
//! 4. **The data lock never spans store I/O** — `update_job_lock` guards
//!    only in-memory field writes; the durable `update_job` call happens
//!    after the lock is released, via a serialized writer task.
//!
//! ## What this is not
//!
//! This crate does not talk to the source server, does not encode or write
//! columnar output, does not enumerate the schema catalog, and does not run
//! its own timer. Those are external collaborators (`TaskExecutor`,
//! `ResourceTypeCatalog`, the host process) it is handed at construction.

mod config;
mod error;
mod executor;
mod manager;
mod model;
mod store;

pub use config::{Clock, Config, SystemClock, DEFAULT_LATENCY_MARGIN_MINUTES};
pub use error::SchedulerError;
pub use executor::{ProgressSink, ResourceTypeCatalog, TaskExecutor};
pub use manager::JobManager;
pub use model::{
    DataPeriod, Job, JobStatus, ResourceProgress, ResourceState, SchedulerMetadata, TaskContext,
    TaskResult,
};
pub use store::JobStore;

// Re-export for convenience since every collaborator signature threads it.
pub use tokio_util::sync::CancellationToken;
