use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use super::{new_claim_token, JobStore, RECLAIM_REASON};
use crate::db::{init_db, parse_ts, ts};
use crate::error::{Result, SchedulerError};
use crate::types::{Job, JobFilter, Reschedule};

const COLUMNS: &str = "id, kind, payload, state, due_at, cron_expression, attempt,
                       max_attempts, last_error, claimed_at, claim_token,
                       created_at, updated_at";

/// SQLite-backed job store.
///
/// Each transition is a single conditional `UPDATE`, so the guarantees hold
/// even when several processes share the database file.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open or create the database file at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        info!(path = %path.as_ref().display(), "job store opened");
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }
}

/// Raw column values, decoded outside the rusqlite row closure so a bad
/// value becomes a `Corrupt` error instead of a driver error.
struct RawJob {
    id: String,
    kind: String,
    payload: String,
    state: String,
    due_at: String,
    cron_expression: Option<String>,
    attempt: u32,
    max_attempts: u32,
    last_error: Option<String>,
    claimed_at: Option<String>,
    claim_token: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            payload: row.get(2)?,
            state: row.get(3)?,
            due_at: row.get(4)?,
            cron_expression: row.get(5)?,
            attempt: row.get(6)?,
            max_attempts: row.get(7)?,
            last_error: row.get(8)?,
            claimed_at: row.get(9)?,
            claim_token: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn decode(self) -> Result<Job> {
        let corrupt = |e: String| SchedulerError::Corrupt(format!("job {}: {e}", self.id));
        Ok(Job {
            kind: self.kind.parse().map_err(corrupt)?,
            state: self.state.parse().map_err(corrupt)?,
            due_at: parse_ts(&self.due_at).map_err(corrupt)?,
            claimed_at: self
                .claimed_at
                .as_deref()
                .map(parse_ts)
                .transpose()
                .map_err(corrupt)?,
            created_at: parse_ts(&self.created_at).map_err(corrupt)?,
            updated_at: parse_ts(&self.updated_at).map_err(corrupt)?,
            payload: self.payload,
            cron_expression: self.cron_expression,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            last_error: self.last_error,
            claim_token: self.claim_token,
            id: self.id,
        })
    }
}

/// Decode a result set, skipping (and logging) rows that fail to decode so
/// one bad record cannot stall the dispatcher.
fn collect_jobs(rows: Vec<RawJob>) -> Vec<Job> {
    rows.into_iter()
        .filter_map(|raw| match raw.decode() {
            Ok(job) => Some(job),
            Err(e) => {
                warn!("skipping undecodable job row: {e}");
                None
            }
        })
        .collect()
}

fn query_jobs(conn: &Connection, sql: &str, args: &[String]) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), RawJob::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(collect_jobs(rows))
}

impl JobStore for SqliteJobStore {
    fn put(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        // Only a deleted record may be overwritten; a live one leaves the
        // statement a no-op, which we report as a duplicate.
        let n = conn.execute(
            "INSERT INTO jobs
             (id, kind, payload, state, due_at, cron_expression, attempt,
              max_attempts, last_error, claimed_at, claim_token, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind, payload = excluded.payload,
                state = excluded.state, due_at = excluded.due_at,
                cron_expression = excluded.cron_expression,
                attempt = excluded.attempt, max_attempts = excluded.max_attempts,
                last_error = excluded.last_error, claimed_at = excluded.claimed_at,
                claim_token = excluded.claim_token,
                created_at = excluded.created_at, updated_at = excluded.updated_at
             WHERE jobs.state = 'deleted'",
            params![
                job.id,
                job.kind.to_string(),
                job.payload,
                job.state.as_str(),
                ts(job.due_at),
                job.cron_expression,
                job.attempt,
                job.max_attempts,
                job.last_error,
                job.claimed_at.map(ts),
                job.claim_token,
                ts(job.created_at),
                ts(job.updated_at),
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::DuplicateJob { id: job.id.clone() });
        }
        debug!(job_id = %job.id, kind = %job.kind, state = %job.state, "job stored");
        Ok(())
    }

    fn upsert_recurring(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs
             (id, kind, payload, state, due_at, cron_expression, attempt,
              max_attempts, last_error, claimed_at, claim_token, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                payload = excluded.payload,
                due_at = excluded.due_at,
                cron_expression = excluded.cron_expression,
                max_attempts = excluded.max_attempts,
                updated_at = excluded.updated_at,
                state = CASE WHEN jobs.state = 'processing'
                             THEN jobs.state ELSE excluded.state END,
                attempt = CASE WHEN jobs.state = 'processing'
                               THEN jobs.attempt ELSE excluded.attempt END,
                last_error = CASE WHEN jobs.state = 'processing'
                                  THEN jobs.last_error ELSE excluded.last_error END,
                claimed_at = CASE WHEN jobs.state = 'processing'
                                  THEN jobs.claimed_at ELSE NULL END,
                claim_token = CASE WHEN jobs.state = 'processing'
                                   THEN jobs.claim_token ELSE NULL END,
                created_at = CASE WHEN jobs.state = 'deleted'
                                  THEN excluded.created_at ELSE jobs.created_at END",
            params![
                job.id,
                job.kind.to_string(),
                job.payload,
                job.state.as_str(),
                ts(job.due_at),
                job.cron_expression,
                job.attempt,
                job.max_attempts,
                job.last_error,
                job.claimed_at.map(ts),
                job.claim_token,
                ts(job.created_at),
                ts(job.updated_at),
            ],
        )?;
        debug!(job_id = %job.id, due_at = %job.due_at, "recurring job upserted");
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Job> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                RawJob::from_row,
            )
            .optional()?;
        match raw {
            Some(raw) => raw.decode(),
            None => Err(SchedulerError::JobNotFound { id: id.to_string() }),
        }
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!("SELECT {COLUMNS} FROM jobs WHERE 1=1");
        let mut args: Vec<String> = Vec::new();

        if filter.states.is_empty() {
            sql.push_str(" AND state != 'deleted'");
        } else {
            let marks = vec!["?"; filter.states.len()].join(",");
            sql.push_str(&format!(" AND state IN ({marks})"));
            args.extend(filter.states.iter().map(|s| s.as_str().to_string()));
        }
        if let Some(kind) = filter.kind {
            sql.push_str(" AND kind = ?");
            args.push(kind.to_string());
        }
        sql.push_str(" ORDER BY due_at, id");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        query_jobs(&conn, &sql, &args)
    }

    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        query_jobs(
            &conn,
            &format!(
                "SELECT {COLUMNS} FROM jobs
                 WHERE state = 'enqueued'
                    OR (state IN ('scheduled', 'idle') AND due_at <= ?1)
                 ORDER BY due_at, id"
            ),
            &[ts(now)],
        )
    }

    fn try_claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                &format!(
                    "UPDATE jobs SET state = 'processing', claimed_at = ?2,
                                     claim_token = ?3, updated_at = ?2
                     WHERE id = ?1
                       AND (state = 'enqueued'
                            OR (state IN ('scheduled', 'idle') AND due_at <= ?2))
                     RETURNING {COLUMNS}"
                ),
                params![id, ts(now), new_claim_token()],
                RawJob::from_row,
            )
            .optional()?;
        raw.map(RawJob::decode).transpose()
    }

    fn mark_succeeded(&self, id: &str, token: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobs SET state = 'succeeded', claimed_at = NULL, claim_token = NULL,
                             updated_at = ?3
             WHERE id = ?1 AND state = 'processing' AND claim_token = ?2",
            params![id, token, ts(now)],
        )?;
        Ok(n == 1)
    }

    fn mark_failed(
        &self,
        id: &str,
        token: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobs SET state = 'failed', claimed_at = NULL, claim_token = NULL,
                             last_error = ?3, attempt = MIN(attempt + 1, max_attempts),
                             updated_at = ?4
             WHERE id = ?1 AND state = 'processing' AND claim_token = ?2",
            params![id, token, error, ts(now)],
        )?;
        Ok(n == 1)
    }

    fn reschedule(
        &self,
        id: &str,
        token: &str,
        to: &Reschedule,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobs SET state = ?3, due_at = ?4, attempt = ?5, last_error = ?6,
                             claimed_at = NULL, claim_token = NULL, updated_at = ?7
             WHERE id = ?1 AND state = 'processing' AND claim_token = ?2",
            params![
                id,
                token,
                to.state.as_str(),
                ts(to.due_at),
                to.attempt,
                to.last_error,
                ts(now)
            ],
        )?;
        Ok(n == 1)
    }

    fn delete(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobs SET state = 'deleted', updated_at = ?2
             WHERE id = ?1 AND state != 'deleted'",
            params![id, ts(now)],
        )?;
        Ok(n == 1)
    }

    fn reclaim_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "UPDATE jobs SET
                state = CASE WHEN kind != 'recurring' AND attempt + 1 >= max_attempts
                             THEN 'failed' ELSE 'scheduled' END,
                attempt = MIN(attempt + 1, max_attempts),
                due_at = ?2, claimed_at = NULL, claim_token = NULL,
                last_error = ?3, updated_at = ?2
             WHERE state = 'processing' AND claimed_at <= ?1
             RETURNING {COLUMNS}"
        ))?;
        let rows = stmt
            .query_map(params![ts(cutoff), ts(now), RECLAIM_REASON], RawJob::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut jobs = collect_jobs(rows);
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM jobs
             WHERE state IN ('succeeded', 'failed', 'deleted') AND updated_at < ?1",
            [ts(before)],
        )?;
        Ok(n)
    }
}
