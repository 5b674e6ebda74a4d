//! JobQueue — durable queue over the `jobs` table.
//!
//! Claiming is a single UPDATE ... RETURNING statement, so concurrent
//! claimers can never take the same job. Completed and failed rows are kept
//! for inspection; nothing prunes them automatically.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use libsql::params;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::{JobKind, JobRecord, JobStatus};
use crate::store::db::Database;

/// Durable job storage.
pub struct JobQueue {
    db: Arc<Database>,
}

impl JobQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new job, due immediately.
    pub async fn enqueue<P: Serialize>(
        &self,
        kind: JobKind,
        payload: &P,
    ) -> Result<JobRecord, DatabaseError> {
        let payload_json = serde_json::to_string(payload)
            .map_err(|e| DatabaseError::Serialization(format!("job payload: {e}")))?;

        let record = JobRecord {
            id: Uuid::new_v4(),
            kind: kind.as_str().to_string(),
            payload: payload_json,
            status: JobStatus::Queued,
            attempts: 0,
            run_at: Utc::now(),
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        self.db
            .conn()
            .execute(
                "INSERT INTO jobs (id, kind, payload, status, attempts, run_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id.to_string(),
                    record.kind.clone(),
                    record.payload.clone(),
                    record.status.as_str(),
                    record.attempts as i64,
                    record.run_at.to_rfc3339(),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue job: {e}")))?;

        debug!(job_id = %record.id, kind = %record.kind, "Job enqueued");
        Ok(record)
    }

    /// Atomically claim the oldest due job, moving it to `running`.
    ///
    /// Returns `None` when nothing is due.
    pub async fn claim_due(&self) -> Result<Option<JobRecord>, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .db
            .conn()
            .query(
                "UPDATE jobs SET status = 'running', updated_at = ?1
                 WHERE id = (
                     SELECT id FROM jobs
                     WHERE status = 'queued' AND run_at <= ?1
                     ORDER BY run_at ASC, created_at ASC
                     LIMIT 1
                 )
                 RETURNING id, kind, payload, status, attempts, run_at, last_error,
                           created_at, updated_at",
                params![now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim job: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read claimed job: {e}")))?
        {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    /// Mark a job done.
    pub async fn complete(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.db
            .conn()
            .execute(
                "UPDATE jobs SET status = 'succeeded', updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete job: {e}")))?;
        debug!(job_id = %id, "Job completed");
        Ok(())
    }

    /// Return a job to the queue for another attempt after `delay`.
    pub async fn retry(&self, id: Uuid, error: &str, delay: Duration) -> Result<(), DatabaseError> {
        let run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self.db
            .conn()
            .execute(
                "UPDATE jobs
                 SET status = 'queued', attempts = attempts + 1, run_at = ?1,
                     last_error = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![
                    run_at.to_rfc3339(),
                    error,
                    Utc::now().to_rfc3339(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("retry job: {e}")))?;
        debug!(job_id = %id, delay_secs = delay.as_secs(), "Job requeued");
        Ok(())
    }

    /// Permanently fail a job. It will never be claimed again.
    pub async fn fail(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        self.db
            .conn()
            .execute(
                "UPDATE jobs
                 SET status = 'failed', attempts = attempts + 1, last_error = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![error, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail job: {e}")))?;
        Ok(())
    }

    /// Return every `running` job to `queued`.
    ///
    /// Called once at startup, before the runner starts: rows left `running`
    /// by a crash would otherwise be stranded. Single-process deployment is
    /// assumed — with the runner live this would steal in-flight jobs.
    pub async fn requeue_stale(&self) -> Result<u64, DatabaseError> {
        let affected = self
            .db
            .conn()
            .execute(
                "UPDATE jobs SET status = 'queued', updated_at = ?1 WHERE status = 'running'",
                params![Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue stale jobs: {e}")))?;
        Ok(affected)
    }

    /// Load one job by id (inspection and tests).
    pub async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT id, kind, payload, status, attempts, run_at, last_error,
                        created_at, updated_at
                 FROM jobs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get job: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read job: {e}")))?
        {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    /// Number of jobs waiting to run.
    pub async fn queued_count(&self) -> Result<i64, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query("SELECT COUNT(*) FROM jobs WHERE status = 'queued'", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count queued jobs: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read queued count: {e}")))?
        {
            Some(row) => Ok(row.get(0).unwrap_or(0)),
            None => Ok(0),
        }
    }
}

/// Map a libsql Row to a JobRecord.
///
/// Column order: 0:id, 1:kind, 2:payload, 3:status, 4:attempts, 5:run_at,
/// 6:last_error, 7:created_at, 8:updated_at
fn row_to_job(row: &libsql::Row) -> Result<JobRecord, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("job id column: {e}")))?;
    let kind: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("job kind column: {e}")))?;
    let payload: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("job payload column: {e}")))?;
    let status_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("job status column: {e}")))?;
    let attempts: i64 = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("job attempts column: {e}")))?;
    let run_at_str: String = row
        .get(5)
        .map_err(|e| DatabaseError::Query(format!("job run_at column: {e}")))?;
    let last_error: Option<String> = row
        .get(6)
        .map_err(|e| DatabaseError::Query(format!("job last_error column: {e}")))?;
    let created_str: String = row
        .get(7)
        .map_err(|e| DatabaseError::Query(format!("job created_at column: {e}")))?;
    let updated_str: String = row
        .get(8)
        .map_err(|e| DatabaseError::Query(format!("job updated_at column: {e}")))?;

    Ok(JobRecord {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        kind,
        payload,
        status: str_to_job_status(&status_str),
        attempts: attempts.max(0) as u32,
        run_at: crate::store::parse_datetime(&run_at_str),
        last_error,
        created_at: crate::store::parse_datetime(&created_str),
        updated_at: crate::store::parse_datetime(&updated_str),
    })
}

/// Parse a job status string from the DB.
fn str_to_job_status(s: &str) -> JobStatus {
    match s {
        "running" => JobStatus::Running,
        "succeeded" => JobStatus::Succeeded,
        "failed" => JobStatus::Failed,
        _ => JobStatus::Queued,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::IntakeJob;

    async fn test_queue() -> JobQueue {
        let db = Arc::new(Database::new_memory().await.unwrap());
        JobQueue::new(db)
    }

    fn sample_payload() -> IntakeJob {
        IntakeJob {
            address: "BANK".into(),
            body: "hello".into(),
        }
    }

    #[tokio::test]
    async fn enqueue_then_claim() {
        let queue = test_queue().await;
        let job = queue
            .enqueue(JobKind::Intake, &sample_payload())
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);

        let claimed = queue.claim_due().await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.kind, "intake");
        assert_eq!(claimed.status, JobStatus::Running);

        let parsed: IntakeJob = serde_json::from_str(&claimed.payload).unwrap();
        assert_eq!(parsed.address, "BANK");
    }

    #[tokio::test]
    async fn claim_on_empty_queue_returns_none() {
        let queue = test_queue().await;
        assert!(queue.claim_due().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claimed_job_is_not_claimable_again() {
        let queue = test_queue().await;
        queue
            .enqueue(JobKind::Intake, &sample_payload())
            .await
            .unwrap();

        assert!(queue.claim_due().await.unwrap().is_some());
        assert!(queue.claim_due().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claims_oldest_due_first() {
        let queue = test_queue().await;
        let first = queue
            .enqueue(JobKind::Intake, &sample_payload())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue
            .enqueue(JobKind::Forward, &sample_payload())
            .await
            .unwrap();

        let claimed = queue.claim_due().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
    }

    #[tokio::test]
    async fn retry_delays_and_counts_attempts() {
        let queue = test_queue().await;
        let job = queue
            .enqueue(JobKind::Forward, &sample_payload())
            .await
            .unwrap();
        queue.claim_due().await.unwrap().unwrap();

        queue
            .retry(job.id, "settings missing", Duration::from_secs(60))
            .await
            .unwrap();

        // Not due yet — run_at is a minute out
        assert!(queue.claim_due().await.unwrap().is_none());

        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("settings missing"));
        assert!(stored.run_at > Utc::now());
    }

    #[tokio::test]
    async fn retry_with_zero_delay_is_immediately_due() {
        let queue = test_queue().await;
        let job = queue
            .enqueue(JobKind::Forward, &sample_payload())
            .await
            .unwrap();
        queue.claim_due().await.unwrap().unwrap();
        queue.retry(job.id, "transient", Duration::ZERO).await.unwrap();

        let claimed = queue.claim_due().await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.attempts, 1);
    }

    #[tokio::test]
    async fn failed_job_stays_failed() {
        let queue = test_queue().await;
        let job = queue
            .enqueue(JobKind::Forward, &sample_payload())
            .await
            .unwrap();
        queue.claim_due().await.unwrap().unwrap();
        queue.fail(job.id, "malformed payload").await.unwrap();

        assert!(queue.claim_due().await.unwrap().is_none());
        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("malformed payload"));
    }

    #[tokio::test]
    async fn complete_marks_succeeded() {
        let queue = test_queue().await;
        let job = queue
            .enqueue(JobKind::Intake, &sample_payload())
            .await
            .unwrap();
        queue.claim_due().await.unwrap().unwrap();
        queue.complete(job.id).await.unwrap();

        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert!(queue.claim_due().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requeue_stale_recovers_running_jobs() {
        let queue = test_queue().await;
        let job = queue
            .enqueue(JobKind::Forward, &sample_payload())
            .await
            .unwrap();
        queue.claim_due().await.unwrap().unwrap();

        // Simulate a crash: the job is stuck in 'running'
        let recovered = queue.requeue_stale().await.unwrap();
        assert_eq!(recovered, 1);

        let claimed = queue.claim_due().await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
    }

    #[tokio::test]
    async fn queued_count_tracks_backlog() {
        let queue = test_queue().await;
        assert_eq!(queue.queued_count().await.unwrap(), 0);
        queue
            .enqueue(JobKind::Intake, &sample_payload())
            .await
            .unwrap();
        queue
            .enqueue(JobKind::Intake, &sample_payload())
            .await
            .unwrap();
        assert_eq!(queue.queued_count().await.unwrap(), 2);

        queue.claim_due().await.unwrap().unwrap();
        assert_eq!(queue.queued_count().await.unwrap(), 1);
    }
}
