use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{new_claim_token, JobStore, RECLAIM_REASON};
use crate::error::{Result, SchedulerError};
use crate::types::{Job, JobFilter, JobKind, JobState, Reschedule};

/// Non-durable store for tests and throwaway runs.
///
/// Transitions run under the shard lock of the job's entry, which gives the
/// same per-job compare-and-set semantics as the SQLite store without a
/// map-wide lock.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: DashMap<String, Job>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` to a job still held by the claim `token`; `false` otherwise.
    fn finish(&self, id: &str, token: &str, f: impl FnOnce(&mut Job)) -> bool {
        match self.jobs.get_mut(id) {
            Some(mut job)
                if job.state == JobState::Processing
                    && job.claim_token.as_deref() == Some(token) =>
            {
                f(&mut *job);
                job.claimed_at = None;
                job.claim_token = None;
                true
            }
            _ => false,
        }
    }
}

fn sorted(mut jobs: Vec<Job>) -> Vec<Job> {
    jobs.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.id.cmp(&b.id)));
    jobs
}

impl JobStore for MemoryJobStore {
    fn put(&self, job: &Job) -> Result<()> {
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(existing) if existing.get().state != JobState::Deleted => {
                Err(SchedulerError::DuplicateJob { id: job.id.clone() })
            }
            Entry::Occupied(mut existing) => {
                existing.insert(job.clone());
                Ok(())
            }
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
                Ok(())
            }
        }
    }

    fn upsert_recurring(&self, job: &Job) -> Result<()> {
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(mut existing) => {
                let current = existing.get_mut();
                if current.state == JobState::Processing {
                    current.kind = job.kind;
                    current.payload = job.payload.clone();
                    current.due_at = job.due_at;
                    current.cron_expression = job.cron_expression.clone();
                    current.max_attempts = job.max_attempts;
                    current.updated_at = job.updated_at;
                } else {
                    let created_at = if current.state == JobState::Deleted {
                        job.created_at
                    } else {
                        current.created_at
                    };
                    *current = Job {
                        created_at,
                        claimed_at: None,
                        claim_token: None,
                        ..job.clone()
                    };
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
            }
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Job> {
        self.jobs
            .get(id)
            .map(|job| job.clone())
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut jobs = sorted(
            self.jobs
                .iter()
                .filter(|entry| filter.matches(entry.value()))
                .map(|entry| entry.value().clone())
                .collect(),
        );
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        Ok(sorted(
            self.jobs
                .iter()
                .filter(|entry| entry.value().is_due(now))
                .map(|entry| entry.value().clone())
                .collect(),
        ))
    }

    fn try_claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        match self.jobs.get_mut(id) {
            Some(mut job) if job.is_due(now) => {
                job.state = JobState::Processing;
                job.claimed_at = Some(now);
                job.claim_token = Some(new_claim_token());
                job.updated_at = now;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    fn mark_succeeded(&self, id: &str, token: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.finish(id, token, |job| {
            job.state = JobState::Succeeded;
            job.updated_at = now;
        }))
    }

    fn mark_failed(
        &self,
        id: &str,
        token: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.finish(id, token, |job| {
            job.state = JobState::Failed;
            job.attempt = (job.attempt + 1).min(job.max_attempts);
            job.last_error = Some(error.to_string());
            job.updated_at = now;
        }))
    }

    fn reschedule(
        &self,
        id: &str,
        token: &str,
        to: &Reschedule,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.finish(id, token, |job| {
            job.state = to.state;
            job.due_at = to.due_at;
            job.attempt = to.attempt;
            job.last_error = to.last_error.clone();
            job.updated_at = now;
        }))
    }

    fn delete(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        match self.jobs.get_mut(id) {
            Some(mut job) if job.state != JobState::Deleted => {
                job.state = JobState::Deleted;
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn reclaim_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut reclaimed = Vec::new();
        for mut entry in self.jobs.iter_mut() {
            let job = entry.value_mut();
            let stale = job.state == JobState::Processing
                && job.claimed_at.is_some_and(|at| at <= cutoff);
            if stale {
                let exhausted = job.attempt + 1 >= job.max_attempts;
                job.state = if exhausted && job.kind != JobKind::Recurring {
                    JobState::Failed
                } else {
                    JobState::Scheduled
                };
                job.attempt = (job.attempt + 1).min(job.max_attempts);
                job.due_at = now;
                job.claimed_at = None;
                job.claim_token = None;
                job.last_error = Some(RECLAIM_REASON.to_string());
                job.updated_at = now;
                reclaimed.push(job.clone());
            }
        }
        Ok(sorted(reclaimed))
    }

    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let start = self.jobs.len();
        self.jobs
            .retain(|_, job| !(job.state.is_finished() && job.updated_at < before));
        Ok(start - self.jobs.len())
    }
}
