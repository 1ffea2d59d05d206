use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a job was created, which decides what happens after it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Run as soon as a worker is free.
    Immediate,
    /// Run once at a caller-chosen instant.
    Scheduled,
    /// Run on every fire of a cron expression.
    Recurring,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobKind::Immediate => "immediate",
            JobKind::Scheduled => "scheduled",
            JobKind::Recurring => "recurring",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(JobKind::Immediate),
            "scheduled" => Ok(JobKind::Scheduled),
            "recurring" => Ok(JobKind::Recurring),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to run now.
    Enqueued,
    /// Waiting for `due_at` (one-off schedule or retry backoff).
    Scheduled,
    /// Recurring job waiting for its next cron fire.
    Idle,
    /// Claimed by exactly one worker.
    Processing,
    Succeeded,
    /// Out of attempts. Never used for recurring jobs.
    Failed,
    /// Soft-deleted; never dispatched again.
    Deleted,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Enqueued,
        JobState::Scheduled,
        JobState::Idle,
        JobState::Processing,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Enqueued => "enqueued",
            JobState::Scheduled => "scheduled",
            JobState::Idle => "idle",
            JobState::Processing => "processing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Deleted => "deleted",
        }
    }

    /// States eligible for the retention sweep.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Deleted
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {s}"))
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Caller-supplied or UUID v4; primary key.
    pub id: String,
    pub kind: JobKind,
    /// Opaque payload handed verbatim to the executor.
    pub payload: String,
    pub state: JobState,
    /// Earliest instant the job may be dispatched.
    pub due_at: DateTime<Utc>,
    /// Set only for [`JobKind::Recurring`].
    pub cron_expression: Option<String>,
    /// Failed attempts in the current cycle.
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    /// When the current `processing` claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Identifies the current claim; completions must present it.
    pub claim_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh record in its initial state for `kind`.
    pub fn new(
        id: String,
        kind: JobKind,
        payload: String,
        due_at: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let state = match kind {
            JobKind::Immediate => JobState::Enqueued,
            JobKind::Scheduled => JobState::Scheduled,
            JobKind::Recurring => JobState::Idle,
        };
        Self {
            id,
            kind,
            payload,
            state,
            due_at,
            cron_expression: None,
            attempt: 0,
            max_attempts,
            last_error: None,
            claimed_at: None,
            claim_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.kind == JobKind::Recurring
    }

    /// Whether a dispatcher polling at `now` should pick this job up.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Enqueued => true,
            JobState::Scheduled | JobState::Idle => self.due_at <= now,
            _ => false,
        }
    }
}

/// Target of a post-execution transition that keeps the job alive.
#[derive(Debug, Clone, PartialEq)]
pub struct Reschedule {
    pub due_at: DateTime<Utc>,
    /// [`JobState::Scheduled`] for a retry, [`JobState::Idle`] for a cron re-arm.
    pub state: JobState,
    pub attempt: u32,
    pub last_error: Option<String>,
}

/// Selection for the status listing.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Restrict to these states; empty means every state except `deleted`.
    pub states: Vec<JobState>,
    pub kind: Option<JobKind>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn state(state: JobState) -> Self {
        Self {
            states: vec![state],
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        let state_ok = if self.states.is_empty() {
            job.state != JobState::Deleted
        } else {
            self.states.contains(&job.state)
        };
        state_ok && self.kind.map_or(true, |k| k == job.kind)
    }
}

/// Read-only operational view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub kind: JobKind,
    pub state: JobState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub due_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            kind: job.kind,
            state: job.state,
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            due_at: job.due_at,
            cron_expression: job.cron_expression.clone(),
            last_error: job.last_error.clone(),
            updated_at: job.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn state_round_trips_through_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>(), Ok(state));
        }
        assert!("running".parse::<JobState>().is_err());
    }

    #[test]
    fn initial_state_follows_kind() {
        let now = Utc::now();
        let mk = |kind| Job::new("j".into(), kind, "{}".into(), now, 3, now).state;
        assert_eq!(mk(JobKind::Immediate), JobState::Enqueued);
        assert_eq!(mk(JobKind::Scheduled), JobState::Scheduled);
        assert_eq!(mk(JobKind::Recurring), JobState::Idle);
    }

    #[test]
    fn enqueued_is_due_regardless_of_due_at() {
        let now = Utc::now();
        let job = Job::new(
            "j".into(),
            JobKind::Immediate,
            "{}".into(),
            now + Duration::hours(1),
            3,
            now,
        );
        assert!(job.is_due(now));
    }

    #[test]
    fn scheduled_waits_for_due_at() {
        let now = Utc::now();
        let mut job = Job::new(
            "j".into(),
            JobKind::Scheduled,
            "{}".into(),
            now + Duration::minutes(5),
            3,
            now,
        );
        assert!(!job.is_due(now));
        assert!(job.is_due(now + Duration::minutes(5)));
        job.state = JobState::Processing;
        assert!(!job.is_due(now + Duration::hours(1)));
    }

    #[test]
    fn default_filter_hides_deleted() {
        let now = Utc::now();
        let mut job = Job::new("j".into(), JobKind::Immediate, "{}".into(), now, 3, now);
        assert!(JobFilter::default().matches(&job));
        job.state = JobState::Deleted;
        assert!(!JobFilter::default().matches(&job));
        assert!(JobFilter::state(JobState::Deleted).matches(&job));
    }
}
