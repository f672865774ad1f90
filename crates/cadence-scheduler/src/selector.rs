use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use cadence_core::ScheduleId;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, warn};

use crate::error::{Result, SchedulerError};
use crate::follow_up::{self, TriggerState};
use crate::interval::{self, whole_seconds};
use crate::store::ScheduleStore;
use crate::types::{Schedule, ScheduleData};

/// Computes which schedules are due at a given instant.
///
/// Read-only: it never writes executions and never touches the registry
/// beyond the snapshot it is handed.
pub struct ScheduleDueSelector {
    store: Arc<dyn ScheduleStore>,
    zone: RwLock<Tz>,
}

impl ScheduleDueSelector {
    pub fn new(store: Arc<dyn ScheduleStore>, zone: Tz) -> Self {
        Self {
            store,
            zone: RwLock::new(zone),
        }
    }

    pub fn zone(&self) -> Tz {
        *self.zone.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_zone(&self, zone: Tz) {
        *self.zone.write().unwrap_or_else(PoisonError::into_inner) = zone;
    }

    /// Schedules due at `now`, excluding those in `running`.
    ///
    /// A schedule whose evaluation fails is logged and skipped; only a failure
    /// to load the schedule list is returned.
    pub fn due_schedules(
        &self,
        now: DateTime<Utc>,
        restrict_to_active: bool,
        running: &HashSet<ScheduleId>,
    ) -> Result<Vec<Schedule>> {
        let schedules = self.store.load_schedules(restrict_to_active)?;
        let zone = self.zone();

        let due: Vec<Schedule> = schedules
            .into_iter()
            .filter(|schedule| !running.contains(&schedule.id))
            .filter(|schedule| match self.is_due(schedule, now, zone) {
                Ok(due) => due,
                Err(e) => {
                    warn!(schedule_id = %schedule.id, kind = schedule.policy.kind(), "skipping schedule: {e}");
                    false
                }
            })
            .collect();

        debug!(count = due.len(), %now, "due schedules computed");
        Ok(due)
    }

    /// Evaluate a single schedule against its persisted history.
    pub fn is_due(&self, schedule: &Schedule, now: DateTime<Utc>, zone: Tz) -> Result<bool> {
        match &schedule.policy {
            ScheduleData::Manual => Ok(false),

            ScheduleData::Once { start } => {
                if whole_seconds(now) < whole_seconds(*start) {
                    return Ok(false);
                }
                // Terminal after the first execution, whatever its outcome.
                Ok(self.store.latest_execution(&schedule.id)?.is_none())
            }

            ScheduleData::Interval {
                start,
                end,
                unit,
                value,
            } => {
                let last_start = self.last_start(&schedule.id)?;
                interval::is_due(*start, *end, *unit, *value, last_start, now, zone).map_err(|e| {
                    SchedulerError::InvalidSchedule {
                        id: schedule.id.to_string(),
                        reason: e.to_string(),
                    }
                })
            }

            ScheduleData::FollowUp {
                triggers,
                only_after_success,
            } => {
                let own_last_start = self.last_start(&schedule.id)?;
                let states = triggers
                    .iter()
                    .map(|trigger| {
                        let latest = self
                            .store
                            .latest_finished_execution(trigger, *only_after_success)?;
                        Ok(TriggerState::new(trigger.clone(), latest))
                    })
                    .collect::<Result<Vec<_>>>()?;

                let qualifying = follow_up::qualifying_trigger(own_last_start, &states, *only_after_success);
                if let Some(trigger) = qualifying {
                    debug!(schedule_id = %schedule.id, trigger = %trigger, "follow-up triggered");
                }
                Ok(qualifying.is_some())
            }
        }
    }

    fn last_start(&self, schedule_id: &ScheduleId) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .latest_execution(schedule_id)?
            .map(|run| run.start_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{Execution, ExecutionOutcome, IntervalUnit, Task};
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeSet;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 12, hour, minute, 0).unwrap()
    }

    fn task() -> Task {
        Task::new("t", "true")
    }

    fn record(store: &MemoryStore, id: &str, start: DateTime<Utc>, code: Option<i32>) {
        let mut run = Execution::started(id.into(), start);
        if let Some(code) = code {
            run.finish(&ExecutionOutcome::new(start, start + Duration::seconds(10), code, String::new()));
        }
        store.insert_execution(&run).unwrap();
    }

    fn selector(store: &MemoryStore) -> ScheduleDueSelector {
        ScheduleDueSelector::new(Arc::new(store.clone()), chrono_tz::UTC)
    }

    fn ids(schedules: &[Schedule]) -> Vec<&str> {
        schedules.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn once_is_terminal_after_any_execution() {
        let store = MemoryStore::new();
        store.put_schedule(Schedule::new("o", task(), ScheduleData::Once { start: at(9, 0) }).with_id("once"));
        let sel = selector(&store);
        let none = HashSet::new();

        assert!(sel.due_schedules(at(8, 59), true, &none).unwrap().is_empty());
        assert_eq!(ids(&sel.due_schedules(at(9, 0), true, &none).unwrap()), ["once"]);

        record(&store, "once", at(9, 0), Some(1));
        assert!(
            sel.due_schedules(at(12, 0), true, &none).unwrap().is_empty(),
            "a failed run still consumes a once schedule"
        );
    }

    #[test]
    fn manual_and_running_schedules_are_never_due() {
        let store = MemoryStore::new();
        store.put_schedule(Schedule::new("m", task(), ScheduleData::Manual).with_id("manual"));
        store.put_schedule(Schedule::new("o", task(), ScheduleData::Once { start: at(0, 0) }).with_id("busy"));
        let sel = selector(&store);

        let running = HashSet::from([ScheduleId::from("busy")]);
        assert!(sel.due_schedules(at(10, 0), true, &running).unwrap().is_empty());
        assert_eq!(ids(&sel.due_schedules(at(10, 0), true, &HashSet::new()).unwrap()), ["busy"]);
    }

    #[test]
    fn inactive_schedules_are_filtered_only_when_requested() {
        let store = MemoryStore::new();
        store.put_schedule(
            Schedule::new("o", task(), ScheduleData::Once { start: at(0, 0) })
                .with_id("paused")
                .active(false),
        );
        let sel = selector(&store);

        assert!(sel.due_schedules(at(1, 0), true, &HashSet::new()).unwrap().is_empty());
        assert_eq!(ids(&sel.due_schedules(at(1, 0), false, &HashSet::new()).unwrap()), ["paused"]);
    }

    #[test]
    fn broken_interval_is_skipped_without_hiding_others() {
        let store = MemoryStore::new();
        let interval = |value| ScheduleData::Interval {
            start: at(0, 0),
            end: None,
            unit: IntervalUnit::Minute,
            value,
        };
        store.put_schedule(Schedule::new("bad", task(), interval(0)).with_id("bad"));
        store.put_schedule(Schedule::new("good", task(), interval(5)).with_id("good"));
        record(&store, "bad", at(1, 0), Some(0));
        record(&store, "good", at(2, 3), Some(0));
        let sel = selector(&store);

        assert!(sel.due_schedules(at(2, 4), true, &HashSet::new()).unwrap().is_empty());
        assert_eq!(ids(&sel.due_schedules(at(2, 5), true, &HashSet::new()).unwrap()), ["good"]);
    }

    #[test]
    fn success_only_follower_sees_older_success_past_newer_failure() {
        let store = MemoryStore::new();
        store.put_schedule(
            Schedule::new(
                "f",
                task(),
                ScheduleData::FollowUp {
                    triggers: BTreeSet::from([ScheduleId::from("a")]),
                    only_after_success: true,
                },
            )
            .with_id("follower"),
        );
        record(&store, "follower", at(10, 0), Some(0));
        record(&store, "a", at(10, 30), Some(0));
        record(&store, "a", at(11, 0), Some(2));
        let sel = selector(&store);

        assert_eq!(ids(&sel.due_schedules(at(11, 5), true, &HashSet::new()).unwrap()), ["follower"]);

        record(&store, "follower", at(11, 10), Some(0));
        assert!(sel.due_schedules(at(11, 15), true, &HashSet::new()).unwrap().is_empty());
    }

    #[test]
    fn follower_ignores_running_trigger() {
        let store = MemoryStore::new();
        store.put_schedule(
            Schedule::new(
                "f",
                task(),
                ScheduleData::FollowUp {
                    triggers: BTreeSet::from([ScheduleId::from("a"), ScheduleId::from("b")]),
                    only_after_success: false,
                },
            )
            .with_id("follower"),
        );
        record(&store, "follower", at(9, 0), Some(0));
        record(&store, "a", at(9, 30), None);
        let sel = selector(&store);
        assert!(sel.due_schedules(at(10, 0), true, &HashSet::new()).unwrap().is_empty());

        record(&store, "b", at(9, 45), Some(1));
        assert_eq!(ids(&sel.due_schedules(at(10, 0), true, &HashSet::new()).unwrap()), ["follower"]);
    }
}
