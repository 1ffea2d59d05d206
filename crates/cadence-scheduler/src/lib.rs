//! `cadence-scheduler`: durable background jobs on top of SQLite.
//!
//! # Overview
//!
//! Every job lives in a [`store::JobStore`]. The [`scheduler::Scheduler`]
//! creates, replaces and deletes jobs; the [`dispatcher::Dispatcher`] polls
//! the store for due jobs, claims them atomically and runs them on a bounded
//! [`worker::WorkerPool`] through an injected [`executor::JobExecutor`].
//!
//! # Job kinds
//!
//! | Kind        | Initial state | After success          |
//! |-------------|---------------|------------------------|
//! | `Immediate` | `enqueued`    | `succeeded`            |
//! | `Scheduled` | `scheduled`   | `succeeded`            |
//! | `Recurring` | `idle`        | `idle` at next cron fire |
//!
//! Failures are retried with exponential backoff up to `max_attempts`; a
//! one-off job then ends `failed`, a recurring job waits for its next fire.
//! A job left `processing` by a crashed worker is handed back after the
//! reclaim timeout, so delivery is at-least-once.

pub mod clock;
pub mod cron;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod policy;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cron::{describe, next_fire_time, CronExpr};
pub use dispatcher::Dispatcher;
pub use error::{ExecutionError, Result, SchedulerError};
pub use executor::JobExecutor;
pub use policy::RetryPolicy;
pub use scheduler::Scheduler;
pub use store::{JobStore, MemoryJobStore, SqliteJobStore, RECLAIM_REASON};
pub use types::{Job, JobFilter, JobKind, JobState, JobSummary, Reschedule};
pub use worker::{WorkerPool, WorkerSlot};
