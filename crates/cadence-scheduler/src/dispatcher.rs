use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    executor::JobExecutor,
    policy::RetryPolicy,
    store::JobStore,
    types::{Job, JobState},
    worker::WorkerPool,
};

const RETENTION_SWEEP_EVERY: StdDuration = StdDuration::from_secs(3600);

/// Polls the store for due jobs and hands them to the worker pool.
///
/// Several dispatchers may share one store (e.g. separate processes on the
/// same SQLite file); `try_claim` guarantees each job runs once per due
/// occurrence.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    pool: WorkerPool,
    poll_interval: StdDuration,
    reclaim_timeout: Duration,
    retention: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn JobExecutor>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        workers: usize,
    ) -> Self {
        let reclaim_timeout = policy.reclaim_timeout;
        let pool = WorkerPool::new(
            workers,
            Arc::clone(&store),
            executor,
            Arc::clone(&clock),
            policy,
        );
        Self {
            store,
            clock,
            pool,
            poll_interval: StdDuration::from_secs(1),
            reclaim_timeout,
            retention: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: StdDuration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Hard-delete finished jobs older than `retention` (hourly sweep).
    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Main loop. Polls every `poll_interval` until `shutdown` broadcasts
    /// `true`, then waits for in-flight jobs to settle.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.pool.size(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "dispatcher started"
        );
        if let Err(e) = self.reclaim() {
            error!(code = e.code(), "startup reclaim failed: {e}");
        }

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(RETENTION_SWEEP_EVERY);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.tick() {
                        error!(code = e.code(), "dispatcher tick error: {e}");
                    }
                }
                _ = sweep.tick(), if self.retention.is_some() => {
                    if let Err(e) = self.purge() {
                        error!(code = e.code(), "retention sweep failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            in_flight = self.pool.size() - self.pool.available(),
            "dispatcher stopping, draining workers"
        );
        self.pool.wait_idle().await;
        info!("dispatcher stopped");
    }

    /// One poll: reclaim stale claims, then dispatch due jobs while there
    /// are free workers. Returns how many jobs were handed to the pool.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn tick(&self) -> Result<usize> {
        self.reclaim()?;

        let now = self.clock.now();
        let mut dispatched = 0;
        for job in self.store.list_due(now)? {
            let Some(slot) = self.pool.try_reserve() else {
                debug!(dispatched, "worker pool saturated, deferring to next tick");
                break;
            };
            match self.claim(&job, now) {
                Ok(claimed) => {
                    debug!(job_id = %claimed.id, kind = %claimed.kind, "job claimed");
                    self.pool.submit(slot, claimed);
                    dispatched += 1;
                }
                Err(SchedulerError::ClaimConflict { id }) => {
                    debug!(job_id = %id, "claim lost to another dispatcher");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(dispatched)
    }

    /// Hand jobs stuck in `processing` beyond the reclaim timeout back to
    /// the queue, charging each one an attempt. Returns how many were
    /// reclaimed.
    pub fn reclaim(&self) -> Result<usize> {
        let now = self.clock.now();
        let jobs = self.store.reclaim_stale(now - self.reclaim_timeout, now)?;
        for job in &jobs {
            if job.state == JobState::Failed {
                error!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    "job stuck in processing ran out of attempts"
                );
            } else {
                warn!(job_id = %job.id, attempt = job.attempt, "reclaimed job stuck in processing");
            }
        }
        Ok(jobs.len())
    }

    /// Run the retention sweep now. No-op without a retention window.
    pub fn purge(&self) -> Result<usize> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };
        let removed = self.store.purge_finished(self.clock.now() - retention)?;
        if removed > 0 {
            info!(removed, "purged finished jobs");
        }
        Ok(removed)
    }

    /// Wait for every in-flight job to settle.
    pub async fn drain(&self) {
        self.pool.wait_idle().await;
    }

    /// Claim `job` and return the claimed record, which carries the claim
    /// token and any payload replaced since `list_due`.
    fn claim(&self, job: &Job, now: DateTime<Utc>) -> Result<Job> {
        self.store
            .try_claim(&job.id, now)?
            .ok_or_else(|| SchedulerError::ClaimConflict { id: job.id.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ExecutionError;
    use crate::store::MemoryJobStore;
    use crate::types::JobKind;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct Gate(tokio::sync::Semaphore);

    #[async_trait]
    impl JobExecutor for Gate {
        async fn execute(&self, _job: &Job) -> std::result::Result<(), ExecutionError> {
            let _permit = self
                .0
                .acquire()
                .await
                .map_err(|e| ExecutionError::new(e.to_string()))?;
            Ok(())
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn saturated_pool_defers_remaining_jobs() {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::new(at()));
        let gate = Arc::new(Gate(tokio::sync::Semaphore::new(0)));
        for id in ["a", "b", "c"] {
            store
                .put(&Job::new(id.into(), JobKind::Immediate, "{}".into(), at(), 3, at()))
                .unwrap();
        }
        let dispatcher = Dispatcher::new(
            store.clone(),
            gate.clone(),
            clock,
            RetryPolicy::default(),
            2,
        );

        assert_eq!(dispatcher.tick().unwrap(), 2);
        assert_eq!(store.get("c").unwrap().state, JobState::Enqueued);
        assert_eq!(dispatcher.tick().unwrap(), 0);

        gate.0.add_permits(3);
        dispatcher.drain().await;
        assert_eq!(dispatcher.tick().unwrap(), 1);
        dispatcher.drain().await;

        for id in ["a", "b", "c"] {
            assert_eq!(store.get(id).unwrap().state, JobState::Succeeded);
        }
    }

    #[tokio::test]
    async fn stale_claims_are_reclaimed_on_tick() {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::new(at()));
        store
            .put(&Job::new("x".into(), JobKind::Immediate, "{}".into(), at(), 3, at()))
            .unwrap();
        assert!(store.try_claim("x", at()).unwrap().is_some());

        let policy = RetryPolicy {
            reclaim_timeout: Duration::minutes(15),
            ..RetryPolicy::default()
        };
        let gate = Arc::new(Gate(tokio::sync::Semaphore::new(10)));
        let dispatcher = Dispatcher::new(store.clone(), gate, clock.clone(), policy, 1);

        assert_eq!(dispatcher.reclaim().unwrap(), 0);
        clock.advance(Duration::minutes(15));
        assert_eq!(dispatcher.tick().unwrap(), 1);
        dispatcher.drain().await;

        let job = store.get("x").unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.attempt, 1);
    }

    #[tokio::test]
    async fn reclaim_fails_job_on_last_attempt() {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::new(at()));
        let mut job = Job::new("y".into(), JobKind::Immediate, "{}".into(), at(), 3, at());
        job.attempt = 2;
        store.put(&job).unwrap();
        assert!(store.try_claim("y", at()).unwrap().is_some());

        let gate = Arc::new(Gate(tokio::sync::Semaphore::new(10)));
        let dispatcher =
            Dispatcher::new(store.clone(), gate, clock.clone(), RetryPolicy::default(), 1);
        clock.advance(Duration::hours(3));
        assert_eq!(dispatcher.tick().unwrap(), 0);

        let job = store.get("y").unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempt, 3);
    }

    #[tokio::test]
    async fn purge_without_retention_is_noop() {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::new(at()));
        let gate = Arc::new(Gate(tokio::sync::Semaphore::new(1)));
        let dispatcher = Dispatcher::new(store, gate, clock, RetryPolicy::default(), 1);
        assert_eq!(dispatcher.purge().unwrap(), 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::new(at()));
        store
            .put(&Job::new("r".into(), JobKind::Immediate, "{}".into(), at(), 3, at()))
            .unwrap();
        let gate = Arc::new(Gate(tokio::sync::Semaphore::new(10)));
        let dispatcher = Dispatcher::new(store.clone(), gate, clock, RetryPolicy::default(), 1)
            .with_poll_interval(StdDuration::from_millis(10));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(dispatcher.run(rx));
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.get("r").unwrap().state, JobState::Succeeded);
    }
}
