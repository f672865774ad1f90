use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use cadence_core::config::SchedulerConfig;
use cadence_core::ScheduleId;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::coordinator::{Admission, ExecutionCoordinator};
use crate::error::{Result, SchedulerError};
use crate::runner::TaskRunner;
use crate::selector::ScheduleDueSelector;
use crate::store::ScheduleStore;
use crate::types::{ExecutionReport, Schedule};

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Host-facing facade: due computation, ad-hoc runs, lifecycle control and
/// the periodic tick loop.
///
/// Methods take `&self`; share the engine through an `Arc` to call
/// [`execute_now`](Self::execute_now) while [`run`](Self::run) is looping.
pub struct SchedulerEngine {
    store: Arc<dyn ScheduleStore>,
    selector: ScheduleDueSelector,
    coordinator: ExecutionCoordinator,
    config: RwLock<SchedulerConfig>,
}

impl SchedulerEngine {
    /// Build an engine on the current tokio runtime.
    ///
    /// Pass `Some(tx)` to receive an [`ExecutionReport`] for every finished run.
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        runner: Arc<dyn TaskRunner>,
        config: SchedulerConfig,
        reports: Option<mpsc::Sender<ExecutionReport>>,
    ) -> Result<Self> {
        let zone = config.zone()?;
        let coordinator = ExecutionCoordinator::new(Arc::clone(&store), runner, &config, reports)?;
        Ok(Self {
            selector: ScheduleDueSelector::new(Arc::clone(&store), zone),
            store,
            coordinator,
            config: RwLock::new(config),
        })
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    fn config(&self) -> SchedulerConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Schedules due at `now` that are not currently running.
    pub fn due_schedules(&self, now: DateTime<Utc>, restrict_to_active: bool) -> Result<Vec<Schedule>> {
        let running = self.coordinator.running_schedules();
        self.selector.due_schedules(now, restrict_to_active, &running)
    }

    /// Start `schedule` immediately, subject to the usual admission checks.
    pub fn execute_now(&self, schedule: &Schedule) -> bool {
        self.coordinator.try_start(schedule).is_started()
    }

    pub fn execute_now_by_id(&self, id: &ScheduleId) -> Result<bool> {
        let schedule = self
            .store
            .load_schedule(id)?
            .ok_or_else(|| SchedulerError::ScheduleNotFound { id: id.to_string() })?;
        Ok(self.execute_now(&schedule))
    }

    pub fn running_schedules(&self) -> HashSet<ScheduleId> {
        self.coordinator.running_schedules()
    }

    pub fn suspend(&self, exempt: HashSet<ScheduleId>) {
        self.coordinator.suspend(exempt);
    }

    pub fn resume(&self) {
        self.coordinator.resume();
    }

    pub fn check_executor(&self, force_restart: bool) -> bool {
        self.coordinator.check_executor(force_restart)
    }

    /// Apply a new scheduler configuration. Returns whether the worker pool
    /// is usable afterwards.
    pub fn reconfigure(&self, config: SchedulerConfig) -> Result<bool> {
        let zone = config.zone()?;
        self.selector.set_zone(zone);
        let alive = self.coordinator.reconfigure(&config);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        info!(zone = zone.name(), "scheduler reconfigured");
        Ok(alive)
    }

    /// Reconcile executions left unfinished by a previous process, per the
    /// configured orphan policy.
    pub fn recover(&self) -> Result<usize> {
        let policy = self.config().orphan_policy;
        let found = self.coordinator.recover(policy)?;
        if found > 0 {
            warn!(count = found, ?policy, "orphaned executions reconciled");
        }
        Ok(found)
    }

    /// One scheduling pass: heal the pool, compute the due set and try to
    /// start every due schedule. Returns the number of runs started.
    ///
    /// The scan runs without the admission lock, so each candidate is
    /// evaluated again under it before it starts. A run admitted in between
    /// (an ad-hoc [`execute_now`](Self::execute_now), say) is then visible.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        if !self.check_executor(false) {
            warn!("worker pool unavailable, admissions will be rejected this tick");
        }
        if self.coordinator.is_suspended() {
            debug!("admission suspended, only exempt schedules start");
        }
        if let Err(e) = self.coordinator.release_resolved_orphans() {
            warn!("orphan reconciliation failed: {e}");
        }

        let due = self.due_schedules(now, true)?;
        let zone = self.selector.zone();
        let mut started = 0;
        for schedule in &due {
            let admission = self
                .coordinator
                .try_start_if(schedule, || self.selector.is_due(schedule, now, zone));
            if let Admission::Started(_) = admission {
                started += 1;
            }
        }
        if started > 0 || !due.is_empty() {
            debug!(due = due.len(), started, "tick finished");
        }
        Ok(started)
    }

    /// Main event loop. Ticks every `tick_interval_secs` until `shutdown`
    /// broadcasts `true`, then closes the worker pool.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler engine started");
        if let Err(e) = self.recover() {
            error!("startup recovery failed: {e}");
        }

        let mut period = self.config().tick_interval_secs.max(1);
        let mut interval = tokio::time::interval(Duration::from_secs(period));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()) {
                        error!("scheduler tick error: {e}");
                    }
                    let configured = self.config().tick_interval_secs.max(1);
                    if configured != period {
                        period = configured;
                        interval = tokio::time::interval(Duration::from_secs(period));
                        // The first tick of a fresh interval fires immediately.
                        interval.tick().await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
        self.coordinator.shutdown();
    }

    /// Wait up to `grace` for in-flight runs to finish. Returns `true` once
    /// nothing is running, `false` if runs were still active at the deadline.
    pub async fn drain(&self, grace: Duration) -> bool {
        let wait = async {
            while !self.coordinator.running_schedules().is_empty() {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        };
        tokio::time::timeout(grace, wait).await.is_ok()
    }
}
