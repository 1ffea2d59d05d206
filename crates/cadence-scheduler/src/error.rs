use thiserror::Error;

/// Failure reported by a [`JobExecutor`](crate::executor::JobExecutor).
///
/// Never returned to API callers; it is recorded on the job as `last_error`
/// and drives the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
    /// Set when the executor was cut off by the per-job timeout.
    pub timed_out: bool,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(after_secs: u64) -> Self {
        Self {
            message: format!("execution timed out after {after_secs}s"),
            timed_out: true,
        }
    }
}

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A live (non-deleted) job already uses this ID.
    #[error("Duplicate job: {id}")]
    DuplicateJob { id: String },

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    /// The requested run time is unusable (e.g. already in the past).
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Job ids must be non-empty.
    #[error("Invalid job id: {0:?}")]
    InvalidJobId(String),

    /// Another dispatcher claimed the job first.
    #[error("Claim conflict on job {id}")]
    ClaimConflict { id: String },

    /// A stored row could not be decoded.
    #[error("Corrupt job record: {0}")]
    Corrupt(String),
}

impl SchedulerError {
    pub(crate) fn invalid_cron(expression: &str, reason: impl Into<String>) -> Self {
        SchedulerError::InvalidCron {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    /// Short error code string for API responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::DuplicateJob { .. } => "DUPLICATE_JOB",
            SchedulerError::JobNotFound { .. } => "NOT_FOUND",
            SchedulerError::InvalidCron { .. } => "INVALID_CRON_EXPRESSION",
            SchedulerError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            SchedulerError::InvalidJobId(_) => "INVALID_JOB_ID",
            SchedulerError::ClaimConflict { .. } => "CLAIM_CONFLICT",
            SchedulerError::Corrupt(_) => "CORRUPT_RECORD",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
