//! Durability and claim exclusivity against a real database file.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cadence_scheduler::{
    Dispatcher, ExecutionError, Job, JobExecutor, JobKind, JobState, JobStore, ManualClock,
    RetryPolicy, Scheduler, SqliteJobStore, RECLAIM_REASON,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

#[derive(Default)]
struct Counter(AtomicUsize);

#[async_trait]
impl JobExecutor for Counter {
    async fn execute(&self, _job: &Job) -> Result<(), ExecutionError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 10, 14, 0, 0).unwrap()
}

#[tokio::test]
async fn job_interrupted_mid_run_is_recovered_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let policy = RetryPolicy {
        reclaim_timeout: Duration::minutes(15),
        ..RetryPolicy::default()
    };

    // First process: enqueue and claim, then "crash" before completing.
    let id = {
        let store = Arc::new(SqliteJobStore::open(&path).unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = Scheduler::new(store.clone(), clock, policy.clone());
        let id = scheduler.enqueue(r#"{"kind":"noop"}"#).unwrap();
        assert!(store.try_claim(&id, t0()).unwrap().is_some());
        id
    };

    // Second process, before the reclaim timeout: the job is left alone.
    let store = Arc::new(SqliteJobStore::open(&path).unwrap());
    let clock = Arc::new(ManualClock::new(t0() + Duration::minutes(10)));
    let counter = Arc::new(Counter::default());
    let dispatcher = Dispatcher::new(
        store.clone(),
        counter.clone(),
        clock.clone(),
        policy,
        2,
    );
    assert_eq!(dispatcher.tick().unwrap(), 0);
    assert_eq!(store.get(&id).unwrap().state, JobState::Processing);

    // Past the timeout it is reclaimed and retried.
    clock.advance(Duration::minutes(5));
    assert_eq!(dispatcher.reclaim().unwrap(), 1);
    let reclaimed = store.get(&id).unwrap();
    assert_eq!(reclaimed.state, JobState::Scheduled);
    assert_eq!(reclaimed.attempt, 1);
    assert_eq!(reclaimed.claim_token, None);
    assert_eq!(reclaimed.last_error.as_deref(), Some(RECLAIM_REASON));

    assert_eq!(dispatcher.tick().unwrap(), 1);
    dispatcher.drain().await;
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    assert_eq!(store.get(&id).unwrap().state, JobState::Succeeded);
}

#[tokio::test]
async fn recurring_definition_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");

    {
        let store = Arc::new(SqliteJobStore::open(&path).unwrap());
        let scheduler = Scheduler::new(
            store,
            Arc::new(ManualClock::new(t0())),
            RetryPolicy::default(),
        );
        scheduler
            .add_or_update_recurring("weekly", "0 0 * * 0", "{}")
            .unwrap();
    }

    let store = SqliteJobStore::open(&path).unwrap();
    let job = store.get("weekly").unwrap();
    assert_eq!(job.kind, JobKind::Recurring);
    assert_eq!(job.state, JobState::Idle);
    assert_eq!(job.cron_expression.as_deref(), Some("0 0 * * 0"));
    // 2026-02-10 is a Tuesday; next Sunday midnight is the 15th.
    assert_eq!(job.due_at, Utc.with_ymd_and_hms(2026, 2, 15, 0, 0, 0).unwrap());
}

#[test]
fn concurrent_claims_across_connections_have_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let seed = SqliteJobStore::open(&path).unwrap();
    seed.put(&Job::new(
        "contested".into(),
        JobKind::Immediate,
        "{}".into(),
        t0(),
        3,
        t0(),
    ))
    .unwrap();

    let stores: Vec<_> = (0..8)
        .map(|_| SqliteJobStore::open(&path).unwrap())
        .collect();
    let handles: Vec<_> = stores
        .into_iter()
        .map(|store| std::thread::spawn(move || store.try_claim("contested", t0()).unwrap().is_some()))
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();

    assert_eq!(winners, 1);
    assert_eq!(seed.get("contested").unwrap().state, JobState::Processing);
}

#[test]
fn claim_token_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let token = {
        let store = SqliteJobStore::open(&path).unwrap();
        store
            .put(&Job::new("held".into(), JobKind::Immediate, "{}".into(), t0(), 3, t0()))
            .unwrap();
        store.try_claim("held", t0()).unwrap().unwrap().claim_token.unwrap()
    };

    let store = SqliteJobStore::open(&path).unwrap();
    assert_eq!(store.get("held").unwrap().claim_token.as_deref(), Some(token.as_str()));
    assert!(!store.mark_succeeded("held", "someone-else", t0()).unwrap());
    assert!(store.mark_succeeded("held", &token, t0()).unwrap());
    assert_eq!(store.get("held").unwrap().state, JobState::Succeeded);
}
