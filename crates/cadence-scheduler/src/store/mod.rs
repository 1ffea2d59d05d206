//! Durable record of jobs, the single source of truth for the scheduler.
//!
//! Every state change is a per-job atomic operation; nothing here spans more
//! than one job, so implementations need no global coordination.

mod memory;
mod sqlite;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{Job, JobFilter, Reschedule};

pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `DuplicateJob` if a non-deleted job has
    /// the same id; a deleted record with that id is replaced.
    fn put(&self, job: &Job) -> Result<()>;

    /// Insert or replace a recurring definition by id.
    ///
    /// When the existing record is `processing`, the new payload, expression
    /// and due time are stored but the state and claim are left alone so the
    /// running worker still owns the job.
    fn upsert_recurring(&self, job: &Job) -> Result<()>;

    /// Fetch a job by id, deleted ones included. `JobNotFound` if absent.
    fn get(&self, id: &str) -> Result<Job>;

    /// Jobs matching `filter`, ordered by `due_at`.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Dispatchable jobs at `now`: every `enqueued` job, plus `scheduled` and
    /// `idle` jobs whose `due_at <= now`. Ordered by `due_at`.
    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Compare-and-set from a claimable state to `processing`.
    ///
    /// On success returns the claimed record, stamped with a fresh
    /// `claim_token`. `None` when the job is missing, deleted, finished, not
    /// yet due or already claimed. At most one concurrent caller gets `Some`.
    fn try_claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// `processing` → `succeeded`. Returns `false` if the claim identified
    /// by `token` no longer holds the job (deleted, reclaimed or re-claimed).
    fn mark_succeeded(&self, id: &str, token: &str, now: DateTime<Utc>) -> Result<bool>;

    /// `processing` → terminal `failed`, recording `error`. Same claim check
    /// as [`mark_succeeded`](Self::mark_succeeded).
    fn mark_failed(&self, id: &str, token: &str, error: &str, now: DateTime<Utc>)
        -> Result<bool>;

    /// `processing` → `scheduled`/`idle` at a new due time. Same claim check
    /// as [`mark_succeeded`](Self::mark_succeeded).
    fn reschedule(&self, id: &str, token: &str, to: &Reschedule, now: DateTime<Utc>)
        -> Result<bool>;

    /// Soft-delete. Returns `false` if the job is unknown or already deleted.
    fn delete(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Revoke claims taken at or before `cutoff` and return the affected jobs.
    ///
    /// A reclaim counts as a failed attempt: the job goes back to
    /// `scheduled`, due at `now`, unless it is a one-off job that has now
    /// used up its attempts, in which case it ends `failed`.
    fn reclaim_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Hard-delete `succeeded`, `failed` and `deleted` jobs last touched
    /// before `before`. Returns how many were removed.
    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Error text stored on a job handed back by [`JobStore::reclaim_stale`].
pub const RECLAIM_REASON: &str = "reclaimed after processing timeout";

fn new_claim_token() -> String {
    Uuid::new_v4().to_string()
}
