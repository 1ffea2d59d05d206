use std::sync::Arc;

use anyhow::Context;
use cadence_core::{CadenceConfig, MailAction};
use cadence_scheduler::{
    cron, Dispatcher, JobFilter, JobKind, JobState, JobSummary, RetryPolicy, Scheduler,
    SqliteJobStore, SystemClock,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;

mod delivery;

use delivery::{LogMailer, MailExecutor};

#[derive(Parser)]
#[command(name = "cadence", about = "Durable background job scheduler", version)]
struct Cli {
    /// Config file (default: $CADENCE_CONFIG or ~/.cadence/cadence.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue an email to send as soon as a worker is free
    Enqueue {
        #[arg(long)]
        to: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
        /// Treat the body as HTML
        #[arg(long)]
        html: bool,
    },
    /// Queue the welcome email for a new user
    Welcome {
        #[arg(long)]
        to: String,
        #[arg(long)]
        name: String,
    },
    /// Queue a password reset email
    PasswordReset {
        #[arg(long)]
        to: String,
        #[arg(long)]
        link: String,
    },
    /// Send an email once at a given time
    Schedule {
        #[arg(long)]
        to: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
        /// RFC 3339 instant, e.g. 2026-05-01T09:00:00Z
        #[arg(long, conflicts_with = "delay_secs", required_unless_present = "delay_secs")]
        at: Option<DateTime<Utc>>,
        /// Seconds from now
        #[arg(long)]
        delay_secs: Option<u64>,
    },
    /// Create or replace a recurring job. Without --subject it sends the daily report.
    Recurring {
        #[arg(long, default_value = "daily-report")]
        id: String,
        #[arg(long, default_value = "0 9 * * *")]
        cron: String,
        /// Recipient (daily report falls back to mail.report_recipient)
        #[arg(long)]
        to: Option<String>,
        #[arg(long, requires_all = ["to", "message"])]
        subject: Option<String>,
        #[arg(long)]
        message: Option<String>,
    },
    /// Delete a job; a running execution finishes but its result is dropped
    Delete { id: String },
    /// List jobs (deleted ones only when asked for by --state)
    List {
        #[arg(long)]
        state: Vec<JobState>,
        #[arg(long)]
        kind: Option<JobKind>,
        #[arg(long)]
        limit: Option<usize>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one job as JSON
    Show { id: String },
    /// Explain a cron expression and print its next fire times
    DescribeCron {
        expression: String,
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
    /// Run the dispatcher until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cadence_cli=info,cadence_scheduler=info,cadence_core=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // explicit flag > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("CADENCE_CONFIG").ok());
    // A missing file already resolves to defaults inside `load`.
    let config = CadenceConfig::load(config_path.as_deref()).context("loading configuration")?;

    if let Commands::DescribeCron { expression, count } = &cli.command {
        return describe_cron(expression, *count);
    }

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    let store = Arc::new(
        SqliteJobStore::open(db_path).with_context(|| format!("opening job store {db_path}"))?,
    );
    let clock = Arc::new(SystemClock);
    let policy = retry_policy(&config);
    let scheduler = Scheduler::new(store.clone(), clock.clone(), policy.clone());

    match cli.command {
        Commands::Enqueue {
            to,
            subject,
            body,
            html,
        } => {
            let action = MailAction::Send {
                to,
                subject,
                body,
                html,
            };
            println!("{}", scheduler.enqueue(action.to_payload()?)?);
        }
        Commands::Welcome { to, name } => {
            let action = MailAction::Welcome {
                to,
                user_name: name,
            };
            println!("{}", scheduler.enqueue(action.to_payload()?)?);
        }
        Commands::PasswordReset { to, link } => {
            let action = MailAction::PasswordReset {
                to,
                reset_link: link,
            };
            println!("{}", scheduler.enqueue(action.to_payload()?)?);
        }
        Commands::Schedule {
            to,
            subject,
            body,
            at,
            delay_secs,
        } => {
            let at = match (at, delay_secs) {
                (Some(at), _) => at,
                (None, Some(secs)) => {
                    let secs = i64::try_from(secs).context("delay too large")?;
                    Utc::now() + chrono::Duration::seconds(secs)
                }
                (None, None) => anyhow::bail!("either --at or --delay-secs is required"),
            };
            let action = MailAction::Send {
                to,
                subject,
                body,
                html: false,
            };
            println!("{}", scheduler.schedule(action.to_payload()?, at)?);
        }
        Commands::Recurring {
            id,
            cron: expression,
            to,
            subject,
            message,
        } => {
            let action = match (to, subject, message) {
                (Some(to), Some(subject), Some(message)) => MailAction::Notification {
                    to,
                    subject,
                    message,
                },
                (to, _, _) => MailAction::DailyReport { to },
            };
            let id = scheduler.add_or_update_recurring(id, &expression, action.to_payload()?)?;
            println!("{id} ({})", cron::describe(&expression));
        }
        Commands::Delete { id } => {
            if scheduler.delete(&id)? {
                println!("deleted {id}");
            } else {
                println!("no live job {id}");
            }
        }
        Commands::List {
            state,
            kind,
            limit,
            json,
        } => {
            let filter = JobFilter {
                states: state,
                kind,
                limit,
            };
            let jobs = scheduler.list(&filter)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                print_table(&jobs);
            }
        }
        Commands::Show { id } => {
            let job = scheduler.get(&id)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Run => {
            let executor = Arc::new(MailExecutor::new(
                Arc::new(LogMailer::new(config.mail.from.clone())),
                config.mail.report_recipient.clone(),
            ));
            let dispatcher = Dispatcher::new(
                store,
                executor,
                clock,
                policy,
                config.scheduler.workers,
            )
            .with_poll_interval(std::time::Duration::from_millis(
                config.scheduler.poll_interval_ms,
            ))
            .with_retention(
                config
                    .scheduler
                    .retention_days
                    .map(|days| chrono::Duration::days(i64::from(days))),
            );

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let engine = tokio::spawn(dispatcher.run(shutdown_rx));
            info!(path = %db_path, "cadence running, press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
            engine.await?;
        }
        Commands::DescribeCron { expression, count } => describe_cron(&expression, count)?,
    }

    Ok(())
}

/// Build the worker retry policy from `[scheduler]` settings.
fn retry_policy(config: &CadenceConfig) -> RetryPolicy {
    let s = &config.scheduler;
    RetryPolicy {
        max_attempts: s.max_attempts,
        backoff_base: secs(s.backoff_base_secs),
        max_backoff: secs(s.max_backoff_secs),
        job_timeout: std::time::Duration::from_secs(s.job_timeout_secs),
        reclaim_timeout: secs(s.reclaim_timeout_secs),
    }
}

fn secs(n: u64) -> chrono::Duration {
    chrono::Duration::seconds(n.min(i64::MAX as u64 / 1_000) as i64)
}

fn describe_cron(expression: &str, count: usize) -> anyhow::Result<()> {
    let expr = cron::CronExpr::parse(expression)?;
    println!("{}", cron::describe(expression));
    let mut after = Utc::now();
    for _ in 0..count {
        after = expr.next_after(after)?;
        println!("  {}", after.to_rfc3339());
    }
    Ok(())
}

fn print_table(jobs: &[JobSummary]) {
    if jobs.is_empty() {
        println!("no jobs");
        return;
    }
    println!(
        "{:<38} {:<10} {:<11} {:>7} {:<25} LAST ERROR",
        "ID", "KIND", "STATE", "ATTEMPT", "DUE"
    );
    for job in jobs {
        println!(
            "{:<38} {:<10} {:<11} {:>7} {:<25} {}",
            job.id,
            job.kind.to_string(),
            job.state.to_string(),
            format!("{}/{}", job.attempt, job.max_attempts),
            job.due_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            job.last_error.as_deref().unwrap_or("-"),
        );
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
