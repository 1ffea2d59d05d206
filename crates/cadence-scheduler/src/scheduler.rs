use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::{
    clock::Clock,
    cron::CronExpr,
    error::{Result, SchedulerError},
    policy::RetryPolicy,
    store::JobStore,
    types::{Job, JobFilter, JobKind, JobSummary},
};

/// Front door for creating, replacing, deleting and inspecting jobs.
///
/// Holds no state of its own; every call goes straight to the store, so any
/// number of `Scheduler`s (and dispatchers) can share one store.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Queue `payload` to run as soon as a worker is free.
    pub fn enqueue(&self, payload: impl Into<String>) -> Result<String> {
        self.enqueue_with_id(Uuid::new_v4().to_string(), payload)
    }

    /// Like [`enqueue`](Self::enqueue) with a caller-chosen id.
    ///
    /// Fails with `DuplicateJob` if a live job already uses `id`.
    pub fn enqueue_with_id(&self, id: impl Into<String>, payload: impl Into<String>) -> Result<String> {
        let id = checked_id(id.into())?;
        let now = self.clock.now();
        let job = Job::new(
            id,
            JobKind::Immediate,
            payload.into(),
            now,
            self.policy.max_attempts,
            now,
        );
        self.store.put(&job)?;
        info!(job_id = %job.id, "job enqueued");
        Ok(job.id)
    }

    /// Run `payload` once at `at`. `at` equal to now is accepted; earlier
    /// instants are rejected.
    pub fn schedule(&self, payload: impl Into<String>, at: DateTime<Utc>) -> Result<String> {
        let now = self.clock.now();
        if at < now {
            return Err(SchedulerError::InvalidSchedule(format!(
                "run time {} is before now ({})",
                at.to_rfc3339(),
                now.to_rfc3339()
            )));
        }
        let job = Job::new(
            Uuid::new_v4().to_string(),
            JobKind::Scheduled,
            payload.into(),
            at,
            self.policy.max_attempts,
            now,
        );
        self.store.put(&job)?;
        info!(job_id = %job.id, due_at = %at, "job scheduled");
        Ok(job.id)
    }

    /// Register `payload` to run on every fire of `cron`, replacing any
    /// existing definition with the same `id`.
    ///
    /// A definition that is currently running keeps running; its next fire
    /// is computed from the new expression when it settles.
    pub fn add_or_update_recurring(
        &self,
        id: impl Into<String>,
        cron: &str,
        payload: impl Into<String>,
    ) -> Result<String> {
        let id = checked_id(id.into())?;
        let expr = CronExpr::parse(cron)?;
        let now = self.clock.now();
        let first = expr.next_after(now)?;

        let mut job = Job::new(
            id,
            JobKind::Recurring,
            payload.into(),
            first,
            self.policy.max_attempts,
            now,
        );
        job.cron_expression = Some(expr.as_str().to_string());
        self.store.upsert_recurring(&job)?;
        info!(job_id = %job.id, cron = %expr, next_fire = %first, "recurring job registered");
        Ok(job.id)
    }

    /// Soft-delete a job. `false` if it is unknown or already deleted.
    ///
    /// A running execution is not interrupted, but its outcome is discarded.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let deleted = self.store.delete(id, self.clock.now())?;
        if deleted {
            info!(job_id = %id, "job deleted");
        }
        Ok(deleted)
    }

    pub fn get(&self, id: &str) -> Result<JobSummary> {
        Ok(JobSummary::from(&self.store.get(id)?))
    }

    pub fn list(&self, filter: &JobFilter) -> Result<Vec<JobSummary>> {
        Ok(self.store.list(filter)?.iter().map(JobSummary::from).collect())
    }
}

fn checked_id(id: String) -> Result<String> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(SchedulerError::InvalidJobId(id));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryJobStore;
    use crate::types::JobState;
    use chrono::{Duration, TimeZone};

    fn scheduler() -> (Scheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 4, 1, 8, 30, 0).unwrap(),
        ));
        let scheduler = Scheduler::new(
            Arc::new(MemoryJobStore::new()),
            clock.clone(),
            RetryPolicy::default(),
        );
        (scheduler, clock)
    }

    #[test]
    fn enqueue_creates_enqueued_job() {
        let (s, _) = scheduler();
        let id = s.enqueue(r#"{"kind":"noop"}"#).unwrap();
        assert!(Uuid::parse_str(&id).is_ok());
        let job = s.get(&id).unwrap();
        assert_eq!(job.state, JobState::Enqueued);
        assert_eq!(job.kind, JobKind::Immediate);
        assert_eq!(job.max_attempts, 3);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let (s, _) = scheduler();
        s.enqueue_with_id("mail-1", "{}").unwrap();
        let err = s.enqueue_with_id("mail-1", "{}").unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_JOB");
    }

    #[test]
    fn schedule_in_the_past_is_rejected() {
        let (s, clock) = scheduler();
        let err = s
            .schedule("{}", clock.now() - Duration::seconds(1))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
        assert!(s.schedule("{}", clock.now()).is_ok());
    }

    #[test]
    fn recurring_gets_first_fire_and_can_be_replaced() {
        let (s, _) = scheduler();
        s.add_or_update_recurring("report", "0 9 * * *", "{}").unwrap();
        let job = s.get("report").unwrap();
        assert_eq!(job.state, JobState::Idle);
        assert_eq!(
            job.due_at,
            Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap()
        );

        s.add_or_update_recurring("report", "@monthly", "{}").unwrap();
        let job = s.get("report").unwrap();
        assert_eq!(job.cron_expression.as_deref(), Some("@monthly"));
        assert_eq!(
            job.due_at,
            Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(s.list(&JobFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn bad_cron_is_rejected_without_storing() {
        let (s, _) = scheduler();
        let err = s.add_or_update_recurring("x", "61 * * * *", "{}").unwrap_err();
        assert_eq!(err.code(), "INVALID_CRON_EXPRESSION");
        assert_eq!(s.get("x").unwrap_err().code(), "NOT_FOUND");
    }

    #[test]
    fn delete_reports_whether_anything_changed() {
        let (s, _) = scheduler();
        let id = s.enqueue("{}").unwrap();
        assert!(s.delete(&id).unwrap());
        assert!(!s.delete(&id).unwrap());
        assert!(!s.delete("missing").unwrap());
        assert!(s.list(&JobFilter::default()).unwrap().is_empty());
        assert_eq!(s.get(&id).unwrap().state, JobState::Deleted);
    }

    #[test]
    fn empty_id_is_rejected() {
        let (s, _) = scheduler();
        let err = s.enqueue_with_id("  ", "{}").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidJobId(_)));
        let err = s.add_or_update_recurring("", "@daily", "{}").unwrap_err();
        assert_eq!(err.code(), "INVALID_JOB_ID");
        assert!(s.list(&JobFilter::default()).unwrap().is_empty());
    }
}
