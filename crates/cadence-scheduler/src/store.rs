//! The persistence boundary of the engine.
//!
//! The engine reads schedules and execution history and writes exactly two
//! execution transitions (insert on admission, finish on completion) through
//! [`ScheduleStore`]. [`MemoryStore`] backs tests and embedded hosts; the
//! SQLite implementation lives in [`crate::sqlite`].

use std::sync::Arc;

use cadence_core::{ExecutionId, ScheduleId};
use dashmap::DashMap;

use crate::error::{Result, SchedulerError};
use crate::types::{Execution, ExecutionOutcome, Schedule};

/// Narrow query/update contract the engine needs from storage.
pub trait ScheduleStore: Send + Sync {
    /// All schedules, or only those with `active == true`.
    fn load_schedules(&self, active_only: bool) -> Result<Vec<Schedule>>;

    fn load_schedule(&self, id: &ScheduleId) -> Result<Option<Schedule>>;

    /// The execution with the newest start time, running or finished.
    fn latest_execution(&self, schedule_id: &ScheduleId) -> Result<Option<Execution>>;

    /// The finished execution with the newest start time, optionally only
    /// among successful ones.
    fn latest_finished_execution(
        &self,
        schedule_id: &ScheduleId,
        success_only: bool,
    ) -> Result<Option<Execution>>;

    fn insert_execution(&self, execution: &Execution) -> Result<()>;

    /// Record the completion of a running execution. Fails with
    /// `ExecutionNotFound` if the row does not exist or is already finished.
    fn finish_execution(&self, id: &ExecutionId, outcome: &ExecutionOutcome) -> Result<()>;

    /// Executions with no end time, oldest first.
    fn unfinished_executions(&self) -> Result<Vec<Execution>>;
}

/// An in-memory store.
///
/// Executions are kept per schedule in insertion order; "latest" means the
/// newest start time, ties going to the later insert.
#[derive(Clone, Default)]
pub struct MemoryStore {
    schedules: Arc<DashMap<ScheduleId, Schedule>>,
    executions: Arc<DashMap<ScheduleId, Vec<Execution>>>,
    /// Reverse index so `finish_execution` does not scan every schedule.
    owners: Arc<DashMap<ExecutionId, ScheduleId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a schedule definition.
    pub fn put_schedule(&self, schedule: Schedule) {
        self.schedules.insert(schedule.id.clone(), schedule);
    }

    pub fn remove_schedule(&self, id: &ScheduleId) -> Result<()> {
        self.schedules
            .remove(id)
            .ok_or_else(|| SchedulerError::ScheduleNotFound { id: id.to_string() })?;
        if let Some((_, runs)) = self.executions.remove(id) {
            for run in runs {
                self.owners.remove(&run.id);
            }
        }
        Ok(())
    }

    /// Full history of one schedule in insertion order.
    pub fn executions(&self, schedule_id: &ScheduleId) -> Vec<Execution> {
        self.executions
            .get(schedule_id)
            .map(|runs| runs.clone())
            .unwrap_or_default()
    }

    fn newest<F>(&self, schedule_id: &ScheduleId, filter: F) -> Option<Execution>
    where
        F: Fn(&Execution) -> bool,
    {
        let runs = self.executions.get(schedule_id)?;
        let newest = runs
            .iter()
            .filter(|run| filter(run))
            // max_by_key returns the last maximum, so later inserts win ties.
            .max_by_key(|run| run.start_time)
            .cloned();
        newest
    }
}

impl ScheduleStore for MemoryStore {
    fn load_schedules(&self, active_only: bool) -> Result<Vec<Schedule>> {
        let mut schedules: Vec<Schedule> = self
            .schedules
            .iter()
            .filter(|entry| !active_only || entry.active)
            .map(|entry| entry.value().clone())
            .collect();
        schedules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(schedules)
    }

    fn load_schedule(&self, id: &ScheduleId) -> Result<Option<Schedule>> {
        Ok(self.schedules.get(id).map(|s| s.value().clone()))
    }

    fn latest_execution(&self, schedule_id: &ScheduleId) -> Result<Option<Execution>> {
        Ok(self.newest(schedule_id, |_| true))
    }

    fn latest_finished_execution(
        &self,
        schedule_id: &ScheduleId,
        success_only: bool,
    ) -> Result<Option<Execution>> {
        Ok(self.newest(schedule_id, |run| {
            run.is_finished() && (!success_only || run.succeeded())
        }))
    }

    fn insert_execution(&self, execution: &Execution) -> Result<()> {
        self.owners
            .insert(execution.id.clone(), execution.schedule_id.clone());
        self.executions
            .entry(execution.schedule_id.clone())
            .or_default()
            .push(execution.clone());
        Ok(())
    }

    fn finish_execution(&self, id: &ExecutionId, outcome: &ExecutionOutcome) -> Result<()> {
        let not_found = || SchedulerError::ExecutionNotFound { id: id.to_string() };
        let schedule_id = self.owners.get(id).map(|s| s.value().clone()).ok_or_else(not_found)?;
        let mut runs = self.executions.get_mut(&schedule_id).ok_or_else(not_found)?;
        let run = runs
            .iter_mut()
            .find(|run| &run.id == id && run.is_running())
            .ok_or_else(not_found)?;
        run.finish(outcome);
        Ok(())
    }

    fn unfinished_executions(&self) -> Result<Vec<Execution>> {
        let mut running: Vec<Execution> = self
            .executions
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|run| run.is_running())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        running.sort_by_key(|run| run.start_time);
        Ok(running)
    }
}
