use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` table (idempotent) and the indexes backing the due-job
/// poll and the processing-timeout sweep.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id              TEXT    NOT NULL PRIMARY KEY,
            kind            TEXT    NOT NULL,   -- immediate | scheduled | recurring
            payload         TEXT    NOT NULL,   -- opaque, passed to the executor
            state           TEXT    NOT NULL,
            due_at          TEXT    NOT NULL,   -- see `ts`
            cron_expression TEXT,
            attempt         INTEGER NOT NULL DEFAULT 0,
            max_attempts    INTEGER NOT NULL,
            last_error      TEXT,
            claimed_at      TEXT,
            claim_token     TEXT,               -- set while processing
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL
        ) STRICT;

        -- SELECT … WHERE state IN (…) AND due_at <= ?  ORDER BY due_at
        CREATE INDEX IF NOT EXISTS idx_jobs_state_due ON jobs (state, due_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_claimed ON jobs (state, claimed_at);
        ",
    )?;
    Ok(())
}

/// Fixed-width UTC timestamp, so string comparison in SQL orders correctly.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp {raw:?}: {e}"))
}
