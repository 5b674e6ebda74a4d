//! JobRunner — claims due jobs and dispatches them to registered handlers.
//!
//! The loop is gated on connectivity: while the relay believes it is
//! offline, due jobs are simply left queued (held, not failed). Retryable
//! handler errors requeue the job with capped exponential backoff and no
//! attempt limit — a job blocked on missing settings keeps retrying until
//! the user supplies them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::JobError;
use crate::jobs::{JobHandler, JobQueue, JobRecord};

/// How long a single connectivity probe may take before counting as offline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ── Connectivity gate ───────────────────────────────────────────────

/// Network-availability gate the runner waits on before claiming work.
///
/// Without a probe task the gate stays at its initial value; the default
/// deployment assumes it is always online.
pub struct ConnectivityGate {
    tx: watch::Sender<bool>,
}

impl ConnectivityGate {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx }
    }

    /// Gate that reports online until told otherwise.
    pub fn assume_online() -> Self {
        Self::new(true)
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Flip the gate. Transitions are logged; repeats are silent.
    pub fn set_online(&self, online: bool) {
        let changed = *self.tx.borrow() != online;
        if changed {
            if online {
                info!("Connectivity restored — resuming job dispatch");
            } else {
                warn!("Connectivity lost — holding queued jobs");
            }
        }
        self.tx.send_replace(online);
    }

    /// Resolve once the gate reports online.
    pub async fn wait_online(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close under us.
        let _ = rx.wait_for(|online| *online).await;
    }
}

/// Periodically probe a TCP endpoint and keep the gate current.
pub fn spawn_probe_task(
    gate: Arc<ConnectivityGate>,
    addr: String,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let online = match tokio::time::timeout(
                PROBE_TIMEOUT,
                tokio::net::TcpStream::connect(&addr),
            )
            .await
            {
                Ok(Ok(_)) => true,
                _ => false,
            };
            gate.set_online(online);
        }
    })
}

// ── Runner ──────────────────────────────────────────────────────────

/// Runner tuning knobs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Poll cadence when the queue is empty.
    pub poll_interval: Duration,
    /// First retry delay; doubles per completed attempt.
    pub retry_base: Duration,
    /// Ceiling on the retry delay.
    pub retry_cap: Duration,
    /// Jobs executing at once.
    pub max_concurrent: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            retry_base: Duration::from_secs(30),
            retry_cap: Duration::from_secs(3600),
            max_concurrent: 4,
        }
    }
}

/// Claims due jobs and runs them on spawned tasks under a concurrency limit.
pub struct JobRunner {
    queue: Arc<JobQueue>,
    gate: Arc<ConnectivityGate>,
    config: RunnerConfig,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    permits: Arc<Semaphore>,
}

impl JobRunner {
    pub fn new(queue: Arc<JobQueue>, gate: Arc<ConnectivityGate>, config: RunnerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            queue,
            gate,
            config,
            handlers: HashMap::new(),
            permits,
        }
    }

    /// Register a handler. Call for every job kind before spawning the loop.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    /// The poll loop. Runs forever; spawn it with [`spawn_runner_task`].
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            self.gate.wait_online().await;
            match self.queue.claim_due().await {
                Ok(Some(job)) => {
                    self.dispatch(job).await;
                    // Keep draining while work is due
                    continue;
                }
                Ok(None) => {
                    interval.tick().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to claim job");
                    interval.tick().await;
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, job: JobRecord) {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            // Semaphore is never closed; bail quietly if it somehow is.
            Err(_) => return,
        };
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            runner.execute(job).await;
        });
    }

    async fn execute(&self, job: JobRecord) {
        let Some(handler) = self.handlers.get(job.kind.as_str()) else {
            let err = JobError::UnknownKind(job.kind.clone());
            error!(job_id = %job.id, kind = %job.kind, "No handler for job kind");
            if let Err(e) = self.queue.fail(job.id, &err.to_string()).await {
                error!(job_id = %job.id, error = %e, "Failed to mark job failed");
            }
            return;
        };

        debug!(
            job_id = %job.id,
            kind = %job.kind,
            attempt = job.attempts + 1,
            "Job started"
        );

        match handler.execute(&job.payload).await {
            Ok(()) => {
                if let Err(e) = self.queue.complete(job.id).await {
                    error!(job_id = %job.id, error = %e, "Failed to mark job succeeded");
                }
                debug!(job_id = %job.id, kind = %job.kind, "Job succeeded");
            }
            Err(err) if err.is_fatal() => {
                error!(job_id = %job.id, kind = %job.kind, error = %err, "Job failed permanently");
                if let Err(e) = self.queue.fail(job.id, &err.to_string()).await {
                    error!(job_id = %job.id, error = %e, "Failed to mark job failed");
                }
            }
            Err(err) => {
                let delay =
                    backoff_delay(job.attempts, self.config.retry_base, self.config.retry_cap);
                warn!(
                    job_id = %job.id,
                    kind = %job.kind,
                    error = %err,
                    retry_in_secs = delay.as_secs(),
                    "Job failed, will retry"
                );
                if let Err(e) = self.queue.retry(job.id, &err.to_string(), delay).await {
                    error!(job_id = %job.id, error = %e, "Failed to requeue job");
                }
            }
        }
    }
}

/// Spawn the runner poll loop.
pub fn spawn_runner_task(runner: Arc<JobRunner>) -> JoinHandle<()> {
    tokio::spawn(async move { runner.run().await })
}

/// Delay before attempt `attempts + 1`: `base * 2^attempts`, capped.
fn backoff_delay(attempts: u32, base: Duration, cap: Duration) -> Duration {
    // Shift bounded well below overflow; the cap flattens everything past it
    let factor = 1u32 << attempts.min(20);
    base.saturating_mul(factor).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::error::JobError;
    use crate::jobs::{JobKind, JobStatus};
    use crate::pipeline::types::IntakeJob;
    use crate::store::Database;

    #[test]
    fn backoff_doubles_until_cap() {
        let base = Duration::from_secs(30);
        let cap = Duration::from_secs(3600);
        assert_eq!(backoff_delay(0, base, cap), Duration::from_secs(30));
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(60));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(120));
        assert_eq!(backoff_delay(6, base, cap), Duration::from_secs(1920));
        assert_eq!(backoff_delay(7, base, cap), cap);
        assert_eq!(backoff_delay(30, base, cap), cap);
        assert_eq!(backoff_delay(u32::MAX, base, cap), cap);
    }

    #[test]
    fn gate_transitions() {
        let gate = ConnectivityGate::assume_online();
        assert!(gate.is_online());
        gate.set_online(false);
        assert!(!gate.is_online());
        gate.set_online(true);
        assert!(gate.is_online());
    }

    #[tokio::test]
    async fn wait_online_resolves_when_flipped() {
        let gate = Arc::new(ConnectivityGate::new(false));
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_online().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.set_online(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
    }

    // ── Handler doubles ─────────────────────────────────────────────

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        /// Fail with a retryable error this many times before succeeding.
        fail_first: usize,
        fatal: bool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        fn kind(&self) -> &'static str {
            "intake"
        }

        async fn execute(&self, _payload: &str) -> Result<(), JobError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fatal {
                return Err(JobError::MalformedPayload("bad".into()));
            }
            if n <= self.fail_first {
                return Err(JobError::Precondition("not yet".into()));
            }
            Ok(())
        }
    }

    async fn setup(
        fail_first: usize,
        fatal: bool,
        gate: Arc<ConnectivityGate>,
    ) -> (Arc<JobQueue>, Arc<AtomicUsize>, JoinHandle<()>) {
        let db = Arc::new(Database::new_memory().await.unwrap());
        let queue = Arc::new(JobQueue::new(db));
        let calls = Arc::new(AtomicUsize::new(0));

        let config = RunnerConfig {
            poll_interval: Duration::from_millis(10),
            retry_base: Duration::ZERO,
            retry_cap: Duration::ZERO,
            max_concurrent: 2,
        };
        let mut runner = JobRunner::new(Arc::clone(&queue), gate, config);
        runner.register(Arc::new(CountingHandler {
            calls: Arc::clone(&calls),
            fail_first,
            fatal,
        }));
        let handle = spawn_runner_task(Arc::new(runner));
        (queue, calls, handle)
    }

    async fn wait_for_status(queue: &JobQueue, id: uuid::Uuid, want: JobStatus) {
        for _ in 0..200 {
            if let Some(job) = queue.get(id).await.unwrap() {
                if job.status == want {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached {:?}", want);
    }

    fn payload() -> IntakeJob {
        IntakeJob {
            address: "X".into(),
            body: "y".into(),
        }
    }

    #[tokio::test]
    async fn runner_executes_queued_job() {
        let gate = Arc::new(ConnectivityGate::assume_online());
        let (queue, calls, handle) = setup(0, false, gate).await;

        let job = queue.enqueue(JobKind::Intake, &payload()).await.unwrap();
        wait_for_status(&queue, job.id, JobStatus::Succeeded).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn runner_retries_until_success() {
        let gate = Arc::new(ConnectivityGate::assume_online());
        let (queue, calls, handle) = setup(2, false, gate).await;

        let job = queue.enqueue(JobKind::Intake, &payload()).await.unwrap();
        wait_for_status(&queue, job.id, JobStatus::Succeeded).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 2);
        handle.abort();
    }

    #[tokio::test]
    async fn runner_fails_fatal_job_without_retry() {
        let gate = Arc::new(ConnectivityGate::assume_online());
        let (queue, calls, handle) = setup(0, true, gate).await;

        let job = queue.enqueue(JobKind::Intake, &payload()).await.unwrap();
        wait_for_status(&queue, job.id, JobStatus::Failed).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn runner_holds_jobs_while_offline() {
        let gate = Arc::new(ConnectivityGate::new(false));
        let (queue, calls, handle) = setup(0, false, Arc::clone(&gate)).await;

        let job = queue.enqueue(JobKind::Intake, &payload()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            queue.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );

        gate.set_online(true);
        wait_for_status(&queue, job.id, JobStatus::Succeeded).await;
        handle.abort();
    }

    #[tokio::test]
    async fn unregistered_kind_is_failed_permanently() {
        let gate = Arc::new(ConnectivityGate::assume_online());
        // Handler registered for "intake" only
        let (queue, _calls, handle) = setup(0, false, gate).await;

        let job = queue.enqueue(JobKind::Forward, &payload()).await.unwrap();
        wait_for_status(&queue, job.id, JobStatus::Failed).await;
        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert!(stored.last_error.unwrap().contains("handler registered"));
        handle.abort();
    }
}
