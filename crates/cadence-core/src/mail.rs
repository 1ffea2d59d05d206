//! Mail job payloads, shared between the job producers and the mail executor.

use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

const SIGNATURE: &str = "<br>\n<p>Best regards,<br>The Team</p>";

/// Stored as a JSON string in the `jobs.payload` column.
///
/// The scheduler never looks inside; the mail executor decodes it at fire
/// time and renders the final message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MailAction {
    /// Free-form message.
    Send {
        to: String,
        subject: String,
        body: String,
        #[serde(default)]
        html: bool,
    },
    /// Sent after a user registers.
    Welcome { to: String, user_name: String },
    PasswordReset { to: String, reset_link: String },
    /// Subject-headed HTML notice.
    Notification {
        to: String,
        subject: String,
        message: String,
    },
    /// Recurring summary. Without `to`, the configured report recipient is used.
    DailyReport {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
}

/// Fully rendered message, ready for a mail transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub html: bool,
}

impl MailAction {
    /// Encode for storage as an opaque job payload.
    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| CadenceError::InvalidPayload(format!("undecodable mail action: {e}")))
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MailAction::Send { .. } => "send",
            MailAction::Welcome { .. } => "welcome",
            MailAction::PasswordReset { .. } => "password_reset",
            MailAction::Notification { .. } => "notification",
            MailAction::DailyReport { .. } => "daily_report",
        }
    }

    /// Produce the message to deliver.
    ///
    /// `report_recipient` is only consulted by [`MailAction::DailyReport`].
    pub fn render(&self, report_recipient: Option<&str>) -> Result<RenderedMail> {
        let mail = match self {
            MailAction::Send {
                to,
                subject,
                body,
                html,
            } => RenderedMail {
                to: to.clone(),
                subject: subject.clone(),
                body: body.clone(),
                html: *html,
            },
            MailAction::Welcome { to, user_name } => RenderedMail {
                to: to.clone(),
                subject: "Welcome aboard!".to_string(),
                body: format!(
                    "<html>\n<body>\n<h2>Welcome {}!</h2>\n\
                     <p>Thank you for registering with our application.</p>\n\
                     <p>We're excited to have you on board!</p>\n{SIGNATURE}\n</body>\n</html>",
                    escape_html(user_name)
                ),
                html: true,
            },
            MailAction::PasswordReset { to, reset_link } => RenderedMail {
                to: to.clone(),
                subject: "Password Reset Request".to_string(),
                body: format!(
                    "<html>\n<body>\n<h2>Password Reset Request</h2>\n\
                     <p>You have requested to reset your password.</p>\n\
                     <p>Click the link below to reset your password:</p>\n\
                     <a href='{}'>Reset Password</a>\n\
                     <p>If you didn't request this, please ignore this email.</p>\n{SIGNATURE}\n</body>\n</html>",
                    escape_html(reset_link)
                ),
                html: true,
            },
            MailAction::Notification {
                to,
                subject,
                message,
            } => notification(to, subject, message),
            MailAction::DailyReport { to } => {
                let to = to.as_deref().or(report_recipient).ok_or_else(|| {
                    CadenceError::InvalidPayload(
                        "daily report has no recipient and mail.report_recipient is unset"
                            .to_string(),
                    )
                })?;
                notification(to, "Daily Report", "This is your daily report.")
            }
        };

        if !looks_like_address(&mail.to) {
            return Err(CadenceError::InvalidPayload(format!(
                "invalid recipient address: {:?}",
                mail.to
            )));
        }
        Ok(mail)
    }
}

fn notification(to: &str, subject: &str, message: &str) -> RenderedMail {
    RenderedMail {
        to: to.to_string(),
        subject: subject.to_string(),
        body: format!(
            "<html>\n<body>\n<h2>{}</h2>\n<p>{}</p>\n{SIGNATURE}\n</body>\n</html>",
            escape_html(subject),
            escape_html(message)
        ),
        html: true,
    }
}

fn looks_like_address(addr: &str) -> bool {
    match addr.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && !addr.contains(char::is_whitespace)
        }
        None => false,
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
