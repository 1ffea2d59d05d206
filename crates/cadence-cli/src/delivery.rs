//! Mail delivery: the executor behind every job this binary creates.

use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::{MailAction, RenderedMail};
use cadence_scheduler::{ExecutionError, Job, JobExecutor};
use tracing::{debug, info};

/// Transport for rendered messages.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &RenderedMail) -> anyhow::Result<()>;
}

/// Writes each message to the log instead of a mail server.
pub struct LogMailer {
    from: String,
}

impl LogMailer {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: &RenderedMail) -> anyhow::Result<()> {
        info!(
            from = %self.from,
            to = %mail.to,
            subject = %mail.subject,
            html = mail.html,
            bytes = mail.body.len(),
            "mail sent"
        );
        debug!(to = %mail.to, body = %mail.body, "mail body");
        Ok(())
    }
}

/// Decodes a [`MailAction`] payload, renders it and hands it to a [`Mailer`].
pub struct MailExecutor {
    mailer: Arc<dyn Mailer>,
    report_recipient: Option<String>,
}

impl MailExecutor {
    pub fn new(mailer: Arc<dyn Mailer>, report_recipient: Option<String>) -> Self {
        Self {
            mailer,
            report_recipient,
        }
    }
}

#[async_trait]
impl JobExecutor for MailExecutor {
    async fn execute(&self, job: &Job) -> Result<(), ExecutionError> {
        let action = MailAction::from_payload(&job.payload)
            .map_err(|e| ExecutionError::new(e.to_string()))?;
        let mail = action
            .render(self.report_recipient.as_deref())
            .map_err(|e| ExecutionError::new(e.to_string()))?;
        debug!(job_id = %job.id, kind = action.kind(), to = %mail.to, "delivering mail");
        self.mailer
            .send(&mail)
            .await
            .map_err(|e| ExecutionError::new(format!("delivery to {} failed: {e}", mail.to)))
    }
}
