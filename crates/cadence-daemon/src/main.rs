use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cadence_core::{CadenceConfig, ScheduleId};
use cadence_runner::ShellTaskRunner;
use cadence_scheduler::{
    ExecutionReport, Schedule, ScheduleData, ScheduleStore, SchedulerEngine, SqliteStore, Task,
};
use chrono::Utc;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

mod cli;

/// How long `run` waits for in-flight tasks after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli.config.or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = Arc::new(SqliteStore::open(db_path)?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config, store).await,
        Command::Due { all } => {
            let engine = build_engine(&config, store, None)?;
            for schedule in engine.due_schedules(Utc::now(), !all)? {
                println!("{}\t{}\t{}", schedule.id, schedule.policy.kind(), schedule.name);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Exec { schedule_id } => exec(config, store, schedule_id).await,
        Command::List => {
            for s in store.load_schedules(false)? {
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    s.id,
                    if s.active { "active" } else { "inactive" },
                    if s.parallel { "parallel" } else { "exclusive" },
                    if s.task.is_internal { "internal" } else { "user" },
                    serde_json::to_string(&s.policy)?,
                    s.task.sanitized_command
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::History { schedule_id, limit } => {
            for run in store.list_executions(&schedule_id.into(), limit)? {
                let status = match run.success {
                    None => "running".to_string(),
                    Some(true) => "ok".to_string(),
                    Some(false) => format!("failed({})", run.result_code.unwrap_or(-1)),
                };
                println!(
                    "{}\t{}\t{}\t{}s",
                    run.id,
                    run.start_time.to_rfc3339(),
                    status,
                    run.duration_secs.unwrap_or(0)
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Add {
            name,
            command,
            policy,
            id,
            task_id,
            parallel,
            inactive,
            internal,
            notify,
        } => {
            let policy: ScheduleData =
                serde_json::from_str(&policy).context("invalid --policy JSON")?;
            let schedule_id = id.map(ScheduleId::from).unwrap_or_default();
            let task_id = task_id.unwrap_or_else(|| schedule_id.to_string());
            let mut task = Task::new(task_id, command);
            if internal {
                task = task.internal();
            }
            let mut schedule = Schedule::new(name, task, policy)
                .with_id(schedule_id)
                .parallel(parallel)
                .active(!inactive);
            schedule.notification_targets = notify;

            store.add_schedule(&schedule)?;
            println!("{}", schedule.id);
            Ok(ExitCode::SUCCESS)
        }
        Command::Enable { schedule_id } => {
            store.set_schedule_active(&schedule_id.into(), true)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Disable { schedule_id } => {
            store.set_schedule_active(&schedule_id.into(), false)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Remove { schedule_id } => {
            store.remove_schedule(&schedule_id.into())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_engine(
    config: &CadenceConfig,
    store: Arc<SqliteStore>,
    reports: Option<mpsc::Sender<ExecutionReport>>,
) -> anyhow::Result<SchedulerEngine> {
    let runner = Arc::new(ShellTaskRunner::new(&config.runner));
    let engine = SchedulerEngine::new(store, runner, config.scheduler.clone(), reports)?;
    Ok(engine)
}

/// Daemon mode: tick until Ctrl-C, logging every finished run.
async fn run(config: CadenceConfig, store: Arc<SqliteStore>) -> anyhow::Result<ExitCode> {
    let (report_tx, mut report_rx) = mpsc::channel::<ExecutionReport>(256);
    let engine = Arc::new(build_engine(&config, store, Some(report_tx))?);

    // Delivery stays external; surface failures with their targets in the log.
    tokio::spawn(async move {
        while let Some(report) = report_rx.recv().await {
            let run = &report.execution;
            if run.succeeded() {
                continue;
            }
            warn!(
                schedule_id = %run.schedule_id,
                execution_id = %run.id,
                schedule = %report.schedule_name,
                task_id = %report.task_id,
                result_code = run.result_code.unwrap_or(-1),
                targets = ?report.notification_targets,
                "scheduled run failed"
            );
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_engine = Arc::clone(&engine);
    let engine_task = tokio::spawn(async move { loop_engine.run(shutdown_rx).await });
    info!(
        tick_secs = config.scheduler.tick_interval_secs,
        workers = config.scheduler.resolved_worker_threads(),
        zone = %config.scheduler.time_zone,
        "cadenced running"
    );

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, stopping");
    let _ = shutdown_tx.send(true);
    engine_task.await?;

    let running = engine.running_schedules().len();
    if running > 0 {
        info!(running, grace_secs = SHUTDOWN_GRACE.as_secs(), "waiting for in-flight runs");
        if !engine.drain(SHUTDOWN_GRACE).await {
            warn!(
                count = engine.running_schedules().len(),
                "exiting with runs in flight, they will be reconciled on next start"
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Run one schedule now and print its output; the exit code mirrors the run.
async fn exec(config: CadenceConfig, store: Arc<SqliteStore>, schedule_id: String) -> anyhow::Result<ExitCode> {
    let (report_tx, mut report_rx) = mpsc::channel::<ExecutionReport>(1);
    let engine = build_engine(&config, store, Some(report_tx))?;

    if !engine.execute_now_by_id(&schedule_id.clone().into())? {
        eprintln!("{schedule_id}: not started (already running, suspended or no free worker)");
        return Ok(ExitCode::FAILURE);
    }
    let report = report_rx
        .recv()
        .await
        .context("engine stopped before the run finished")?;

    let run = report.execution;
    if let Some(output) = run.output.as_deref() {
        print!("{output}");
    }
    if run.succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        let code = run.result_code.unwrap_or(-1);
        eprintln!("{schedule_id}: failed with result code {code}");
        Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
