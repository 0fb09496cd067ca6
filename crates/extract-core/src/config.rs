//! Static configuration and the injectable clock.
//!
//! This crate does not parse configuration sources itself (no env/file
//! loading here) — the host assembles a [`Config`] and hands it to
//! [`crate::manager::JobManager::new`], the same division of labor the
//! teacher leaves to the application embedding it.

use chrono::{DateTime, Utc};

/// Default latency margin absorbing upstream write-visibility lag.
pub const DEFAULT_LATENCY_MARGIN_MINUTES: i64 = 2;

#[derive(Debug, Clone)]
pub struct Config {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub container_name: String,
    pub resource_type_filters: Vec<String>,
    pub max_concurrency_count: usize,
    pub job_query_latency_minutes: i64,
}

impl Config {
    /// Fails fast on a configuration that would deadlock or misbehave rather
    /// than surfacing the problem lazily on the first `trigger`.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.max_concurrency_count > 0,
            "max_concurrency_count must be positive"
        );
        anyhow::ensure!(
            self.job_query_latency_minutes >= 0,
            "job_query_latency_minutes must not be negative"
        );
        if let Some(end_time) = self.end_time {
            anyhow::ensure!(
                self.start_time < end_time,
                "start_time must precede end_time"
            );
        }
        Ok(())
    }

    pub fn latency_margin(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.job_query_latency_minutes)
    }
}

/// Injectable source of wall-clock time, so orchestration tests never race a
/// real clock. Mirrors the teacher's pattern of threading collaborators
/// through explicitly rather than calling `Utc::now()` from business logic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
