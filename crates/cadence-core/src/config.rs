use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 15;
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 3_600; // never wait more than an hour between retries
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_RECLAIM_TIMEOUT_SECS: u64 = 900; // must stay above the job timeout

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub mail: MailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Dispatch and retry policy.
///
/// None of these values are fixed by the job model itself; every deployment
/// tunes them to its executor's latency profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay between two polls of the job store.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum number of jobs executing at the same time.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Execution attempts before a one-off job is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Retry delay is `backoff_base_secs * 2^attempt`.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Upper bound on a single executor call.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// A job left in `processing` longer than this is assumed orphaned by a
    /// crashed worker and handed back to the dispatcher.
    #[serde(default = "default_reclaim_timeout_secs")]
    pub reclaim_timeout_secs: u64,
    /// Finished and deleted jobs older than this are purged. `None` keeps
    /// them forever.
    #[serde(default)]
    pub retention_days: Option<u32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            job_timeout_secs: default_job_timeout_secs(),
            reclaim_timeout_secs: default_reclaim_timeout_secs(),
            retention_days: None,
        }
    }
}

impl SchedulerConfig {
    /// Reject settings the dispatcher cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.workers == 0 {
            return Err(crate::error::CadenceError::Config(
                "scheduler.workers must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(crate::error::CadenceError::Config(
                "scheduler.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(crate::error::CadenceError::Config(
                "scheduler.poll_interval_ms must be positive".to_string(),
            ));
        }
        // A live job must never be reclaimed while its executor can still run.
        if self.reclaim_timeout_secs <= self.job_timeout_secs {
            return Err(crate::error::CadenceError::Config(format!(
                "scheduler.reclaim_timeout_secs ({}) must exceed scheduler.job_timeout_secs ({})",
                self.reclaim_timeout_secs, self.job_timeout_secs
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// Sender shown on every outgoing message.
    #[serde(default = "default_mail_from")]
    pub from: String,
    /// Addressee of the built-in daily report job.
    #[serde(default)]
    pub report_recipient: Option<String>,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            from: default_mail_from(),
            report_recipient: None,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_backoff_base_secs() -> u64 {
    DEFAULT_BACKOFF_BASE_SECS
}
fn default_max_backoff_secs() -> u64 {
    DEFAULT_MAX_BACKOFF_SECS
}
fn default_job_timeout_secs() -> u64 {
    DEFAULT_JOB_TIMEOUT_SECS
}
fn default_reclaim_timeout_secs() -> u64 {
    DEFAULT_RECLAIM_TIMEOUT_SECS
}
fn default_mail_from() -> String {
    "Cadence <noreply@localhost>".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CADENCE_SCHEDULER__MAX_ATTEMPTS=5`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))?;

        config.scheduler.validate()?;
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_jail| {
            let config = CadenceConfig::load(Some("does-not-exist.toml")).unwrap();
            assert_eq!(config.scheduler.max_attempts, DEFAULT_MAX_ATTEMPTS);
            assert_eq!(config.scheduler.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
            assert!(config.scheduler.workers >= 1);
            assert!(config.scheduler.retention_days.is_none());
            Ok(())
        });
    }

    #[test]
    fn file_values_and_env_overrides_merge() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [database]
                path = "/tmp/jobs.db"

                [scheduler]
                workers = 2
                max_attempts = 7
                retention_days = 30

                [mail]
                report_recipient = "ops@example.com"
                "#,
            )?;
            jail.set_env("CADENCE_SCHEDULER__MAX_ATTEMPTS", "4");

            let config = CadenceConfig::load(Some("cadence.toml")).unwrap();
            assert_eq!(config.database.path, "/tmp/jobs.db");
            assert_eq!(config.scheduler.workers, 2);
            assert_eq!(config.scheduler.max_attempts, 4);
            assert_eq!(config.scheduler.retention_days, Some(30));
            assert_eq!(
                config.mail.report_recipient.as_deref(),
                Some("ops@example.com")
            );
            Ok(())
        });
    }

    #[test]
    fn reclaim_timeout_must_exceed_job_timeout() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                "[scheduler]\njob_timeout_secs = 7200\nreclaim_timeout_secs = 60\n",
            )?;
            let err = CadenceConfig::load(Some("cadence.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            assert!(err.to_string().contains("reclaim_timeout_secs"));

            jail.set_env("CADENCE_SCHEDULER__RECLAIM_TIMEOUT_SECS", "7200");
            assert!(CadenceConfig::load(Some("cadence.toml")).is_err());
            jail.set_env("CADENCE_SCHEDULER__RECLAIM_TIMEOUT_SECS", "7201");
            assert!(CadenceConfig::load(Some("cadence.toml")).is_ok());
            Ok(())
        });
    }

    #[test]
    fn malformed_value_is_an_error_not_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                "[database]\npath = \"/srv/jobs.db\"\n[scheduler]\nworkers = \"many\"\n",
            )?;
            let err = CadenceConfig::load(Some("cadence.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            Ok(())
        });
    }

    #[test]
    fn zero_workers_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("cadence.toml", "[scheduler]\nworkers = 0\n")?;
            let err = CadenceConfig::load(Some("cadence.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            Ok(())
        });
    }
}
