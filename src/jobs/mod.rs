//! Durable job system — at-least-once background execution over SQLite.
//!
//! Core components:
//! - `queue` — the `jobs` table: enqueue, atomic claim, complete/retry/fail
//! - `runner` — poll loop dispatching claimed jobs to registered handlers,
//!   gated on connectivity, with capped exponential backoff
//!
//! Jobs survive restarts: a crash mid-execution leaves a `running` row that
//! startup recovery requeues, so handlers must tolerate re-delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::JobError;

pub mod queue;
pub mod runner;

pub use queue::JobQueue;
pub use runner::{ConnectivityGate, JobRunner, RunnerConfig, spawn_probe_task, spawn_runner_task};

// ── Job kinds ───────────────────────────────────────────────────────

/// The units of work this relay schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Match a received message against the rules and create the record.
    Intake,
    /// Submit a pending record to the backend and conclude it.
    Forward,
}

impl JobKind {
    /// Stable string stored in the `jobs.kind` column and used to look up
    /// the handler.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Forward => "forward",
        }
    }
}

// ── Job status ──────────────────────────────────────────────────────

/// Queue-level state of a job. Distinct from any business outcome the
/// handler records: a `forward` job succeeds even when the backend reports
/// a delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

// ── Job record ──────────────────────────────────────────────────────

/// A row in the `jobs` table.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    /// Handler key. Kept as a raw string so an unknown kind (schema drift)
    /// can be failed explicitly instead of silently coerced.
    pub kind: String,
    /// JSON payload, deserialized by the handler.
    pub payload: String,
    pub status: JobStatus,
    /// Completed attempts so far (0 on first delivery).
    pub attempts: u32,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Handler trait ───────────────────────────────────────────────────

/// A unit-of-work implementation the runner dispatches to.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job kind this handler executes.
    fn kind(&self) -> &'static str;

    /// Run one job. The payload is the raw JSON stored at enqueue time.
    ///
    /// Errors decide the job's fate: fatal errors mark it `failed`,
    /// everything else requeues it with backoff.
    async fn execute(&self, payload: &str) -> Result<(), JobError>;
}
