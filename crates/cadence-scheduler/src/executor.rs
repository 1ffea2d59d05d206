use async_trait::async_trait;

use crate::error::ExecutionError;
use crate::types::Job;

/// The side-effecting action behind every job.
///
/// The scheduler never interprets `job.payload`; implementations decode it
/// and perform the work (send a mail, call a webhook, ...). Returning `Err`
/// hands the job to the retry policy.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<(), ExecutionError>;
}
