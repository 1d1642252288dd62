mod common;

use std::time::Duration;

use common::{eventually, Harness};
use jobagent_core::{store::Store, RunStatus};
use jobagent_scheduler::{LoopState, SchedulerEngine};
use jobagent_store::{NewJob, NewStep};
use tokio::sync::watch;

const LIMIT: Duration = Duration::from_secs(10);

async fn finished_with(h: &Harness, job: i64, status: RunStatus) -> bool {
    eventually(LIMIT, || async move {
        h.store()
            .latest_job_log(job)
            .unwrap()
            .is_some_and(|log| log.status == status)
    })
    .await
}

#[tokio::test]
async fn cycle_claims_runs_and_releases_a_due_job() {
    let h = Harness::new();
    let job = h.add_job(&NewJob::due_now("tick"), &[NewStep::batch("ok", "exit 0")]);

    let mut engine = SchedulerEngine::new(h.context());
    assert_eq!(engine.state(), LoopState::Connecting);
    engine.run_cycle().unwrap();
    assert!(finished_with(&h, job, RunStatus::Succeed).await);

    let claim = h.store().job_claim(job).unwrap();
    assert_eq!(claim.agent_id, None);
    assert_eq!(claim.next_run, None);

    // A one-shot job is not claimed again.
    engine.run_cycle().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let runs: i64 = h
        .store()
        .connection()
        .query_row("SELECT COUNT(*) FROM job_log WHERE job_id = ?1", [job], |row| row.get(0))
        .unwrap();
    assert_eq!(runs, 1);
}

#[tokio::test]
async fn jobs_pinned_to_another_host_are_left_alone() {
    let h = Harness::new();
    let mut pinned = NewJob::due_now("pinned");
    pinned.host_agent = "other-host".to_string();
    let job = h.add_job(&pinned, &[NewStep::batch("ok", "exit 0")]);

    let mut engine = SchedulerEngine::new(h.context());
    engine.run_cycle().unwrap();
    assert!(engine.handle().running_jobs().is_empty());
    assert_eq!(h.store().job_claim(job).unwrap().agent_id, None);
    assert!(h.store().latest_job_log(job).unwrap().is_none());
}

#[tokio::test]
async fn startup_cleanup_aborts_work_of_vanished_agents() {
    let h = Harness::new();
    let job = h.add_job(&NewJob::due_now("orphan"), &[NewStep::batch("ok", "exit 0")]);
    let mut store = h.store();
    store
        .connection()
        .execute("UPDATE job SET agent_id = 'ghost', next_run = NULL WHERE id = ?1", [job])
        .unwrap();
    store.create_job_log(job).unwrap();

    let mut engine = SchedulerEngine::new(h.context());
    engine.run_cycle().unwrap();

    let log = h.store().latest_job_log(job).unwrap().unwrap();
    assert_eq!(log.status, RunStatus::Aborted);
    assert_eq!(h.store().job_claim(job).unwrap().agent_id, None);
}

#[cfg(unix)]
#[tokio::test]
async fn kill_signal_cancels_a_running_job() {
    let h = Harness::new();
    let job = h.add_job(&NewJob::due_now("long"), &[NewStep::batch("sleeper", "sleep 30")]);

    let mut engine = SchedulerEngine::new(h.context());
    let handle = engine.handle();
    engine.run_cycle().unwrap();
    assert!(handle.is_running(job));

    h.store().notify_kill_job(job).unwrap();
    engine.run_cycle().unwrap();
    assert!(finished_with(&h, job, RunStatus::Aborted).await);
    let running = &handle;
    assert!(eventually(LIMIT, || async move { !running.is_running(job) }).await);

    // A signal for a job that is not running here is ignored.
    h.store().notify_kill_job(job).unwrap();
    engine.run_cycle().unwrap();
    assert!(!handle.cancel_job(job));
}

#[cfg(unix)]
#[tokio::test]
async fn running_job_is_not_dispatched_twice() {
    let h = Harness::new();
    let job = h.add_job(&NewJob::due_now("busy"), &[NewStep::batch("sleeper", "sleep 30")]);

    let mut engine = SchedulerEngine::new(h.context());
    let handle = engine.handle();
    engine.run_cycle().unwrap();
    assert!(handle.is_running(job));

    // Force the row claimable again while the first run is still going.
    h.store()
        .connection()
        .execute(
            "UPDATE job SET agent_id = NULL, next_run = '2000-01-01T00:00:00.000Z' WHERE id = ?1",
            [job],
        )
        .unwrap();
    engine.run_cycle().unwrap();
    assert_eq!(handle.running_jobs(), vec![job]);
    let runs: i64 = h
        .store()
        .connection()
        .query_row("SELECT COUNT(*) FROM job_log WHERE job_id = ?1", [job], |row| row.get(0))
        .unwrap();
    assert_eq!(runs, 1);

    assert!(handle.cancel_job(job));
    assert!(finished_with(&h, job, RunStatus::Aborted).await);
}

#[tokio::test]
async fn two_agents_never_run_the_same_job() {
    let h = Harness::new();
    let jobs: Vec<i64> = (0..4)
        .map(|i| h.add_job(&NewJob::due_now(format!("job {i}")), &[NewStep::batch("ok", "exit 0")]))
        .collect();

    let mut first = SchedulerEngine::new(h.context());
    let mut second = SchedulerEngine::new(h.context());
    assert_ne!(first.agent_id(), second.agent_id());
    first.run_cycle().unwrap();
    second.run_cycle().unwrap();

    for &job in &jobs {
        assert!(finished_with(&h, job, RunStatus::Succeed).await);
    }
    let runs: i64 = h
        .store()
        .connection()
        .query_row("SELECT COUNT(*) FROM job_log", [], |row| row.get(0))
        .unwrap();
    assert_eq!(runs, jobs.len() as i64);
}

#[cfg(unix)]
#[tokio::test]
async fn shutdown_aborts_running_jobs_and_returns() {
    let h = Harness::new();
    let job = h.add_job(&NewJob::due_now("long"), &[NewStep::batch("sleeper", "sleep 30")]);

    let engine = SchedulerEngine::new(h.context());
    let handle = engine.handle();
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(engine.run(rx));

    let running = &handle;
    assert!(eventually(LIMIT, || async move { running.is_running(job) }).await);
    tx.send(true).unwrap();
    tokio::time::timeout(LIMIT, task).await.unwrap().unwrap();

    let log = h.store().latest_job_log(job).unwrap().unwrap();
    assert_eq!(log.status, RunStatus::Aborted);
    assert_eq!(h.store().job_claim(job).unwrap().agent_id, None);
}
