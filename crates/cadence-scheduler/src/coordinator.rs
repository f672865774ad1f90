//! Admission and execution of schedule runs.
//!
//! Every admission decision and every registry update happens under one
//! mutex, so "is it running?" and "mark it running" can never interleave with
//! another request for the same schedule. Scheduled starts re-evaluate their
//! due condition under the same mutex, and an unfinished row written by
//! another process counts as running. Task execution itself runs on the
//! worker pool without that lock.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cadence_core::config::{OrphanPolicy, SchedulerConfig};
use cadence_core::{ExecutionId, ScheduleId};
use chrono::Utc;
use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::interval::whole_seconds;
use crate::lifecycle::ExecutorLifecycle;
use crate::registry::{Conflict, RunningRegistry};
use crate::runner::{OutputSink, TaskRunner};
use crate::store::ScheduleStore;
use crate::types::{Execution, ExecutionOutcome, ExecutionReport, Schedule};

/// Output recorded for runs that were cut short by a process exit.
pub const INTERRUPTED_OUTPUT: &str = "interrupted: process exited before completion";

/// Result code recorded when a task produced none (fault, panic, interruption).
pub const NO_RESULT_CODE: i32 = -1;

/// Outcome of a start request.
#[derive(Debug, Clone)]
pub enum Admission {
    Started(Execution),
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_started(&self) -> bool {
        matches!(self, Admission::Started(_))
    }
}

/// Why a run was not started. Rejections are expected, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Suspended,
    PoolUnavailable,
    AlreadyRunning,
    NonParallelSlotHeld { holder: ScheduleId },
    /// The due condition no longer held when re-checked under the lock.
    NoLongerDue,
    PoolFull,
    Persistence(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Suspended => write!(f, "admission suspended"),
            RejectReason::PoolUnavailable => write!(f, "worker pool unavailable"),
            RejectReason::AlreadyRunning => write!(f, "already running"),
            RejectReason::NonParallelSlotHeld { holder } => {
                write!(f, "non-parallel slot held by {holder}")
            }
            RejectReason::NoLongerDue => write!(f, "no longer due"),
            RejectReason::PoolFull => write!(f, "worker pool at capacity"),
            RejectReason::Persistence(e) => write!(f, "could not record execution: {e}"),
        }
    }
}

impl From<Conflict> for RejectReason {
    fn from(conflict: Conflict) -> Self {
        match conflict {
            Conflict::AlreadyRunning => RejectReason::AlreadyRunning,
            Conflict::NonParallelSlotHeld { holder } => RejectReason::NonParallelSlotHeld { holder },
        }
    }
}

struct State {
    registry: RunningRegistry,
    lifecycle: ExecutorLifecycle,
    capacity: usize,
    max_output_chars: usize,
    /// Runs left over from a previous process under `OrphanPolicy::Block`.
    blocked_orphans: HashMap<ScheduleId, ExecutionId>,
}

struct Inner {
    store: Arc<dyn ScheduleStore>,
    runner: Arc<dyn TaskRunner>,
    state: Mutex<State>,
    reports: Option<mpsc::Sender<ExecutionReport>>,
}

impl Inner {
    // The state is plain bookkeeping that is valid between statements, so a
    // panic elsewhere while holding the lock does not corrupt it.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Starts runs, records their lifecycle and enforces the concurrency rules.
///
/// Cheap to clone; clones share the same registry and pool.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    inner: Arc<Inner>,
}

impl ExecutionCoordinator {
    /// Create a coordinator bound to the current tokio runtime.
    ///
    /// Pass `Some(tx)` to receive an [`ExecutionReport`] for every finished
    /// run. Delivery uses `try_send`, so a slow consumer never stalls a worker.
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        runner: Arc<dyn TaskRunner>,
        config: &SchedulerConfig,
        reports: Option<mpsc::Sender<ExecutionReport>>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| SchedulerError::NoRuntime(e.to_string()))?;
        let capacity = config.resolved_worker_threads();
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                runner,
                state: Mutex::new(State {
                    registry: RunningRegistry::new(),
                    lifecycle: ExecutorLifecycle::new(capacity, runtime),
                    capacity,
                    max_output_chars: config.max_output_chars,
                    blocked_orphans: HashMap::new(),
                }),
                reports,
            }),
        })
    }

    /// Try to start a run of `schedule` now.
    pub fn try_start(&self, schedule: &Schedule) -> Admission {
        self.try_start_if(schedule, || Ok(true))
    }

    /// Like [`try_start`](Self::try_start), but `still_due` is evaluated
    /// under the admission lock after the running checks and must confirm
    /// the start. An evaluation error rejects with
    /// [`RejectReason::NoLongerDue`].
    pub fn try_start_if<F>(&self, schedule: &Schedule, still_due: F) -> Admission
    where
        F: FnOnce() -> Result<bool>,
    {
        let mut state = self.inner.lock();

        if !state.lifecycle.suspension().allows(&schedule.id) {
            return reject(schedule, RejectReason::Suspended);
        }
        if !state.lifecycle.pool().is_alive() {
            return reject(schedule, RejectReason::PoolUnavailable);
        }
        if let Err(conflict) = state.registry.check(&schedule.id, schedule.parallel) {
            return reject(schedule, conflict.into());
        }
        match self.inner.store.latest_execution(&schedule.id) {
            Ok(Some(run)) if run.is_running() => {
                debug!(
                    schedule_id = %schedule.id,
                    execution_id = %run.id,
                    "unfinished execution recorded outside this coordinator"
                );
                return reject(schedule, RejectReason::AlreadyRunning);
            }
            Ok(_) => {}
            Err(e) => return reject(schedule, RejectReason::Persistence(e.to_string())),
        }
        match still_due() {
            Ok(true) => {}
            Ok(false) => return reject(schedule, RejectReason::NoLongerDue),
            Err(e) => {
                warn!(schedule_id = %schedule.id, "due re-check failed: {e}");
                return reject(schedule, RejectReason::NoLongerDue);
            }
        }
        let Some(permit) = state.lifecycle.pool().try_reserve() else {
            return reject(schedule, RejectReason::PoolFull);
        };

        let execution = Execution::started(schedule.id.clone(), whole_seconds(Utc::now()));
        if let Err(e) = self.inner.store.insert_execution(&execution) {
            error!(schedule_id = %schedule.id, "failed to record execution start: {e}");
            return reject(schedule, RejectReason::Persistence(e.to_string()));
        }
        state.registry.admit(&schedule.id, schedule.parallel);

        info!(
            schedule_id = %schedule.id,
            execution_id = %execution.id,
            task = %schedule.task.sanitized_command,
            "execution admitted"
        );

        let worker = run_worker(
            Arc::clone(&self.inner),
            schedule.clone(),
            execution.clone(),
            permit,
            state.max_output_chars,
        );
        state.lifecycle.pool().spawn(worker);

        Admission::Started(execution)
    }

    /// Schedules with a run in flight.
    pub fn running_schedules(&self) -> HashSet<ScheduleId> {
        self.inner.lock().registry.snapshot()
    }

    pub fn is_running(&self, schedule_id: &ScheduleId) -> bool {
        self.inner.lock().registry.contains(schedule_id)
    }

    /// Reject new runs except for `exempt` schedules until [`resume`](Self::resume).
    pub fn suspend(&self, exempt: HashSet<ScheduleId>) {
        let mut state = self.inner.lock();
        info!(exempt = exempt.len(), "admission suspended");
        state.lifecycle.suspension_mut().suspend(exempt);
    }

    pub fn resume(&self) {
        self.inner.lock().lifecycle.suspension_mut().resume();
        info!("admission resumed");
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.lock().lifecycle.suspension().is_suspended()
    }

    /// Ensure the worker pool is usable, recreating it if it is dead or if
    /// `force_restart` is set. In-flight runs are not affected.
    pub fn check_executor(&self, force_restart: bool) -> bool {
        let mut state = self.inner.lock();
        let capacity = state.capacity;
        state.lifecycle.ensure_pool(force_restart, capacity)
    }

    /// Apply new pool and output settings. A capacity change restarts the pool.
    pub fn reconfigure(&self, config: &SchedulerConfig) -> bool {
        let capacity = config.resolved_worker_threads();
        let restart = {
            let mut state = self.inner.lock();
            state.max_output_chars = config.max_output_chars;
            let changed = state.capacity != capacity;
            state.capacity = capacity;
            changed
        };
        info!(capacity, restart, "coordinator reconfigured");
        self.check_executor(restart)
    }

    /// Close the worker pool. Running tasks finish; nothing new is admitted
    /// until [`check_executor`](Self::check_executor) recreates the pool.
    pub fn shutdown(&self) {
        let state = self.inner.lock();
        state.lifecycle.pool().close();
        info!(running = state.registry.len(), "worker pool closed");
    }

    /// Reconcile executions that a previous process left unfinished.
    ///
    /// Returns the number of orphaned executions found.
    pub fn recover(&self, policy: OrphanPolicy) -> Result<usize> {
        let orphans = self.inner.store.unfinished_executions()?;
        if orphans.is_empty() {
            return Ok(0);
        }

        for run in &orphans {
            match policy {
                OrphanPolicy::MarkFailed => {
                    let outcome = ExecutionOutcome::new(
                        run.start_time,
                        whole_seconds(Utc::now()),
                        NO_RESULT_CODE,
                        INTERRUPTED_OUTPUT.to_string(),
                    );
                    self.inner.store.finish_execution(&run.id, &outcome)?;
                    warn!(
                        schedule_id = %run.schedule_id,
                        execution_id = %run.id,
                        "orphaned execution marked failed"
                    );
                }
                OrphanPolicy::Block => {
                    // A deleted schedule cannot hold the non-parallel slot.
                    let parallel = self
                        .inner
                        .store
                        .load_schedule(&run.schedule_id)?
                        .map_or(true, |s| s.parallel);
                    let mut state = self.inner.lock();
                    state.registry.admit(&run.schedule_id, parallel);
                    state
                        .blocked_orphans
                        .insert(run.schedule_id.clone(), run.id.clone());
                    warn!(
                        schedule_id = %run.schedule_id,
                        execution_id = %run.id,
                        "orphaned execution blocks its schedule until finished"
                    );
                }
            }
        }
        Ok(orphans.len())
    }

    /// Release blocked orphans whose rows have since been finished by an operator.
    pub fn release_resolved_orphans(&self) -> Result<usize> {
        let pending: Vec<(ScheduleId, ExecutionId)> = {
            let state = self.inner.lock();
            if state.blocked_orphans.is_empty() {
                return Ok(0);
            }
            state
                .blocked_orphans
                .iter()
                .map(|(s, e)| (s.clone(), e.clone()))
                .collect()
        };

        let mut released = 0;
        for (schedule_id, execution_id) in pending {
            let still_running = self
                .inner
                .store
                .latest_execution(&schedule_id)?
                .is_some_and(|run| run.id == execution_id && run.is_running());
            if still_running {
                continue;
            }
            let mut state = self.inner.lock();
            state.blocked_orphans.remove(&schedule_id);
            state.registry.release(&schedule_id);
            released += 1;
            info!(schedule_id = %schedule_id, execution_id = %execution_id, "orphaned execution resolved");
        }
        Ok(released)
    }
}

fn reject(schedule: &Schedule, reason: RejectReason) -> Admission {
    debug!(schedule_id = %schedule.id, %reason, "execution rejected");
    Admission::Rejected(reason)
}

/// Body of one admitted run. Holds its pool permit while the task runs.
async fn run_worker(
    inner: Arc<Inner>,
    schedule: Schedule,
    execution: Execution,
    permit: OwnedSemaphorePermit,
    max_output_chars: usize,
) {
    let sink = OutputSink::new(max_output_chars);
    let result = AssertUnwindSafe(inner.runner.execute(&schedule.task, &sink))
        .catch_unwind()
        .await;

    let result_code = match result {
        Ok(Ok(code)) => code,
        Ok(Err(fault)) => {
            sink.writeln(&fault.to_string());
            NO_RESULT_CODE
        }
        Err(panic) => {
            let message = format!("task panicked: {}", panic_message(panic.as_ref()));
            error!(schedule_id = %schedule.id, execution_id = %execution.id, "{message}");
            sink.writeln(&message);
            NO_RESULT_CODE
        }
    };

    drop(permit);

    let outcome = ExecutionOutcome::new(
        execution.start_time,
        whole_seconds(Utc::now()),
        result_code,
        sink.finish(),
    );
    complete(&inner, &schedule, execution, outcome);
}

/// Persist the outcome, release the registry entry and report.
fn complete(inner: &Inner, schedule: &Schedule, mut execution: Execution, outcome: ExecutionOutcome) {
    if let Err(e) = inner.store.finish_execution(&execution.id, &outcome) {
        error!(
            schedule_id = %schedule.id,
            execution_id = %execution.id,
            "failed to record execution result: {e}"
        );
    }
    inner.lock().registry.release(&schedule.id);

    if outcome.success {
        info!(
            schedule_id = %schedule.id,
            execution_id = %execution.id,
            duration_secs = outcome.duration_secs,
            "execution succeeded"
        );
    } else {
        warn!(
            schedule_id = %schedule.id,
            execution_id = %execution.id,
            result_code = outcome.result_code,
            duration_secs = outcome.duration_secs,
            "execution failed"
        );
    }

    if let Some(tx) = &inner.reports {
        execution.finish(&outcome);
        let report = ExecutionReport {
            execution,
            schedule_name: schedule.name.clone(),
            task_id: schedule.task.id.clone(),
            notification_targets: schedule.notification_targets.clone(),
        };
        if tx.try_send(report).is_err() {
            warn!(schedule_id = %schedule.id, "report channel full or closed, report dropped");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
