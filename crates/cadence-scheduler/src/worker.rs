use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    cron::next_fire_time,
    error::{ExecutionError, Result, SchedulerError},
    executor::JobExecutor,
    policy::RetryPolicy,
    store::JobStore,
    types::{Job, JobState, Reschedule},
};

/// A reserved execution slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct WorkerSlot(#[allow(dead_code)] OwnedSemaphorePermit);

/// Fixed-size set of concurrent executions.
///
/// The dispatcher reserves a slot before claiming a job, so a claimed job
/// always has a worker waiting for it and the dispatcher never blocks on
/// the pool.
pub struct WorkerPool {
    size: usize,
    slots: Arc<Semaphore>,
    ctx: Arc<WorkerContext>,
}

struct WorkerContext {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn JobExecutor>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn JobExecutor>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        let size = size.max(1);
        Self {
            size,
            slots: Arc::new(Semaphore::new(size)),
            ctx: Arc::new(WorkerContext {
                store,
                executor,
                clock,
                policy,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Reserve a slot without waiting; `None` when every worker is busy.
    pub fn try_reserve(&self) -> Option<WorkerSlot> {
        Arc::clone(&self.slots).try_acquire_owned().ok().map(WorkerSlot)
    }

    /// Run a claimed job on a reserved slot.
    ///
    /// The slot is released once the outcome has been written to the store.
    pub fn submit(&self, slot: WorkerSlot, job: Job) -> JoinHandle<()> {
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let _slot = slot;
            ctx.run(job).await;
        })
    }

    /// Wait until every in-flight execution has settled.
    pub async fn wait_idle(&self) {
        let permits = u32::try_from(self.size).unwrap_or(u32::MAX);
        if let Ok(all) = self.slots.acquire_many(permits).await {
            drop(all);
        }
    }
}

impl WorkerContext {
    async fn run(&self, job: Job) {
        debug!(job_id = %job.id, attempt = job.attempt, "job started");
        let timeout = self.policy.job_timeout;
        let outcome = match tokio::time::timeout(timeout, self.executor.execute(&job)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::timeout(timeout.as_secs())),
        };

        if let Err(e) = self.settle(&job, outcome) {
            // The job stays `processing` and is picked up again by reclaim.
            error!(job_id = %job.id, code = e.code(), "failed to record job outcome: {e}");
        }
    }

    fn settle(&self, job: &Job, outcome: std::result::Result<(), ExecutionError>) -> Result<()> {
        let Some(token) = job.claim_token.as_deref() else {
            return Err(SchedulerError::Corrupt(format!(
                "job {} was submitted without a claim",
                job.id
            )));
        };
        let now = self.clock.now();
        match outcome {
            Ok(()) if job.is_recurring() => self.rearm(job, token, None, now),
            Ok(()) => {
                if self.store.mark_succeeded(&job.id, token, now)? {
                    info!(job_id = %job.id, "job succeeded");
                } else {
                    debug!(job_id = %job.id, "job left processing while running; result dropped");
                }
                Ok(())
            }
            Err(e) => self.fail(job, token, e, now),
        }
    }

    fn fail(&self, job: &Job, token: &str, e: ExecutionError, now: DateTime<Utc>) -> Result<()> {
        let attempt = job.attempt + 1;
        if self.policy.should_retry(attempt, job.max_attempts) {
            let due_at = now + self.policy.backoff(attempt);
            let retry = Reschedule {
                due_at,
                state: JobState::Scheduled,
                attempt,
                last_error: Some(e.message.clone()),
            };
            if self.store.reschedule(&job.id, token, &retry, now)? {
                warn!(
                    job_id = %job.id,
                    attempt,
                    max_attempts = job.max_attempts,
                    timed_out = e.timed_out,
                    retry_at = %due_at,
                    "job failed, retrying: {e}"
                );
            }
            return Ok(());
        }

        if job.is_recurring() {
            warn!(
                job_id = %job.id,
                attempt,
                "recurring job out of attempts, waiting for next fire: {e}"
            );
            return self.rearm(job, token, Some(e.message), now);
        }

        if self.store.mark_failed(&job.id, token, &e.message, now)? {
            error!(job_id = %job.id, attempt, "job failed permanently: {e}");
        }
        Ok(())
    }

    /// Put a recurring job back to `idle` at its next fire after `now`.
    ///
    /// Reads the stored definition first: the expression may have been
    /// replaced while the job was running.
    fn rearm(
        &self,
        job: &Job,
        token: &str,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let current = self.store.get(&job.id)?;
        let expression = current.cron_expression.as_deref().ok_or_else(|| {
            SchedulerError::Corrupt(format!("recurring job {} has no cron expression", job.id))
        })?;

        let due_at = match next_fire_time(expression, now) {
            Ok(due_at) => due_at,
            Err(e) => {
                error!(job_id = %job.id, "cannot re-arm recurring job: {e}");
                self.store.mark_failed(&job.id, token, &e.to_string(), now)?;
                return Ok(());
            }
        };

        let next = Reschedule {
            due_at,
            state: JobState::Idle,
            attempt: 0,
            last_error,
        };
        if self.store.reschedule(&job.id, token, &next, now)? {
            info!(job_id = %job.id, next_fire = %due_at, "recurring job re-armed");
        } else {
            debug!(job_id = %job.id, "recurring job left processing while running");
        }
        Ok(())
    }
}
