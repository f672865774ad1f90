//! End-to-end flows through the engine with the SQLite store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::config::{OrphanPolicy, SchedulerConfig};
use cadence_core::ScheduleId;
use cadence_scheduler::{
    Execution, ExecutionOutcome, ExecutionReport, IntervalUnit, OutputSink, Schedule, ScheduleData,
    ScheduleStore, SchedulerEngine, SqliteStore, Task, TaskFault, TaskRunner,
};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use tokio::sync::{mpsc, Notify};

/// Commands starting with `wait` block until the gate opens; the last word is the exit code.
struct ScriptRunner {
    gate: Notify,
}

#[async_trait]
impl TaskRunner for ScriptRunner {
    async fn execute(&self, task: &Task, sink: &OutputSink) -> Result<i32, TaskFault> {
        if task.command.starts_with("wait") {
            self.gate.notified().await;
        }
        sink.writeln(&task.command);
        let code = task.command.rsplit(' ').next().unwrap_or("0");
        code.parse().map_err(|_| TaskFault::Other(format!("bad exit code {code}")))
    }
}

struct Setup {
    store: Arc<SqliteStore>,
    runner: Arc<ScriptRunner>,
    engine: SchedulerEngine,
    reports: mpsc::Receiver<ExecutionReport>,
}

fn setup(config: SchedulerConfig) -> Setup {
    let store = Arc::new(SqliteStore::new(Connection::open_in_memory().unwrap()).unwrap());
    let runner = Arc::new(ScriptRunner { gate: Notify::new() });
    let (tx, reports) = mpsc::channel(32);
    let engine = SchedulerEngine::new(store.clone(), runner.clone(), config, Some(tx)).unwrap();
    Setup {
        store,
        runner,
        engine,
        reports,
    }
}

async fn report(rx: &mut mpsc::Receiver<ExecutionReport>) -> ExecutionReport {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("run finished in time")
        .expect("report channel open")
}

fn due_ids(engine: &SchedulerEngine, now: DateTime<Utc>) -> Vec<String> {
    engine
        .due_schedules(now, true)
        .unwrap()
        .into_iter()
        .map(|s| s.id.to_string())
        .collect()
}

fn long_ago_interval() -> ScheduleData {
    ScheduleData::Interval {
        start: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        end: None,
        unit: IntervalUnit::Day,
        value: 1,
    }
}

#[tokio::test]
async fn follow_up_runs_after_successful_trigger() {
    let mut s = setup(SchedulerConfig::default());
    let extract = Schedule::new("extract", Task::new("extract", "extract 0"), ScheduleData::Manual)
        .with_id("extract")
        .notify("data-team@example.com");
    let load = Schedule::new(
        "load",
        Task::new("load", "load 0"),
        ScheduleData::FollowUp {
            triggers: BTreeSet::from([extract.id.clone()]),
            only_after_success: true,
        },
    )
    .with_id("load");
    s.store.add_schedule(&extract).unwrap();
    s.store.add_schedule(&load).unwrap();

    assert!(due_ids(&s.engine, Utc::now()).is_empty());

    assert!(s.engine.execute_now_by_id(&extract.id).unwrap());
    let done = report(&mut s.reports).await;
    assert_eq!(done.schedule_name, "extract");
    assert_eq!(done.notification_targets, vec!["data-team@example.com".to_string()]);
    assert!(done.execution.succeeded());

    assert_eq!(due_ids(&s.engine, Utc::now()), ["load"]);
    assert_eq!(s.engine.tick(Utc::now()).unwrap(), 1);
    let done = report(&mut s.reports).await;
    assert_eq!(done.execution.schedule_id.as_str(), "load");

    assert!(due_ids(&s.engine, Utc::now()).is_empty(), "follow-up consumed the trigger run");
}

#[tokio::test]
async fn non_parallel_schedules_share_one_slot() {
    let mut s = setup(SchedulerConfig::default());
    for id in ["a", "b"] {
        let schedule = Schedule::new(id, Task::new(id, "wait 0"), long_ago_interval()).with_id(id);
        s.store.add_schedule(&schedule).unwrap();
    }
    let parallel = Schedule::new("p", Task::new("p", "wait 0"), long_ago_interval())
        .with_id("p")
        .parallel(true);
    s.store.add_schedule(&parallel).unwrap();

    // Schedules load in id order: "a" takes the slot, "b" is rejected, "p" runs alongside.
    assert_eq!(s.engine.tick(Utc::now()).unwrap(), 2);
    let running = s.engine.running_schedules();
    assert!(running.contains(&ScheduleId::from("a")));
    assert!(running.contains(&ScheduleId::from("p")));
    assert!(!running.contains(&ScheduleId::from("b")));

    // Neither running schedule is due again while in flight.
    assert_eq!(due_ids(&s.engine, Utc::now()), ["b"]);
    assert_eq!(s.engine.tick(Utc::now()).unwrap(), 0);

    s.runner.gate.notify_one();
    report(&mut s.reports).await;
    s.runner.gate.notify_one();
    report(&mut s.reports).await;

    assert_eq!(s.engine.tick(Utc::now()).unwrap(), 1, "b gets the freed slot");
    s.runner.gate.notify_one();
    report(&mut s.reports).await;
    assert_eq!(s.store.list_executions(&"b".into(), 10).unwrap().len(), 1);
}

#[tokio::test]
async fn daily_interval_follows_berlin_wall_clock_across_fall_back() {
    let s = setup(SchedulerConfig {
        time_zone: "Europe/Berlin".into(),
        ..SchedulerConfig::default()
    });
    // Midnight local time, CEST.
    let start = Utc.with_ymd_and_hms(2023, 10, 27, 22, 0, 0).unwrap();
    let daily = Schedule::new(
        "daily",
        Task::new("daily", "report 0"),
        ScheduleData::Interval {
            start,
            end: None,
            unit: IntervalUnit::Day,
            value: 1,
        },
    )
    .with_id("daily");
    s.store.add_schedule(&daily).unwrap();

    // Last run at local midnight on the day the clocks go back.
    let last = Utc.with_ymd_and_hms(2023, 10, 28, 22, 0, 0).unwrap();
    let mut run = Execution::started(daily.id.clone(), last);
    run.finish(&ExecutionOutcome::new(last, last, 0, String::new()));
    s.store.insert_execution(&run).unwrap();

    // That local day lasts 25 hours: the next local midnight is 23:00 UTC.
    let same_utc_time = Utc.with_ymd_and_hms(2023, 10, 29, 22, 0, 0).unwrap();
    let next_midnight = Utc.with_ymd_and_hms(2023, 10, 29, 23, 0, 0).unwrap();
    assert!(due_ids(&s.engine, same_utc_time).is_empty());
    assert_eq!(due_ids(&s.engine, next_midnight), ["daily"]);
}

#[tokio::test]
async fn minute_interval_waits_for_next_slot() {
    let s = setup(SchedulerConfig::default());
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let every_five = Schedule::new(
        "poll",
        Task::new("poll", "poll 0"),
        ScheduleData::Interval {
            start,
            end: Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()),
            unit: IntervalUnit::Minute,
            value: 5,
        },
    )
    .with_id("poll");
    s.store.add_schedule(&every_five).unwrap();

    let last = Utc.with_ymd_and_hms(2024, 1, 1, 2, 3, 0).unwrap();
    s.store
        .insert_execution(&Execution::started(every_five.id.clone(), last))
        .unwrap();

    assert!(due_ids(&s.engine, Utc.with_ymd_and_hms(2024, 1, 1, 2, 4, 0).unwrap()).is_empty());
    assert_eq!(due_ids(&s.engine, Utc.with_ymd_and_hms(2024, 1, 1, 2, 5, 0).unwrap()), ["poll"]);
    assert!(
        due_ids(&s.engine, Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap()).is_empty(),
        "closed window"
    );
}

#[tokio::test]
async fn orphaned_runs_are_failed_on_recovery() {
    let mut s = setup(SchedulerConfig {
        orphan_policy: OrphanPolicy::MarkFailed,
        ..SchedulerConfig::default()
    });
    let nightly = Schedule::new("nightly", Task::new("nightly", "backup 0"), ScheduleData::Manual)
        .with_id("nightly");
    s.store.add_schedule(&nightly).unwrap();
    let orphan = Execution::started(nightly.id.clone(), Utc::now() - chrono::Duration::hours(1));
    s.store.insert_execution(&orphan).unwrap();

    assert_eq!(s.engine.recover().unwrap(), 1);
    let history = s.store.list_executions(&nightly.id, 5).unwrap();
    assert_eq!(history[0].success, Some(false));
    assert_eq!(history[0].result_code, Some(-1));

    assert!(s.engine.execute_now(&nightly));
    assert!(report(&mut s.reports).await.execution.succeeded());
}

#[tokio::test]
async fn second_engine_on_the_same_database_sees_the_running_row() {
    let mut s = setup(SchedulerConfig::default());
    let nightly = Schedule::new("nightly", Task::new("nightly", "wait 0"), ScheduleData::Manual)
        .with_id("nightly");
    s.store.add_schedule(&nightly).unwrap();
    assert!(s.engine.execute_now(&nightly));

    // A CLI process opening the same file starts with an empty registry.
    let cli = SchedulerEngine::new(s.store.clone(), s.runner.clone(), SchedulerConfig::default(), None)
        .unwrap();
    assert!(!cli.execute_now_by_id(&nightly.id).unwrap());
    assert_eq!(s.store.unfinished_executions().unwrap().len(), 1);

    s.runner.gate.notify_one();
    assert!(report(&mut s.reports).await.execution.succeeded());
    assert!(cli.execute_now_by_id(&nightly.id).unwrap());
}
