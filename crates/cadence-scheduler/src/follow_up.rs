//! Due-evaluation for follow-up schedules.
//!
//! A follow-up runs after any one of its triggers has finished a run that
//! started after the follow-up's own last run. Triggers are independent: one
//! that is still running or has nothing new does not hold back the others.

use cadence_core::ScheduleId;
use chrono::{DateTime, Utc};

use crate::interval::whole_seconds;
use crate::types::Execution;

/// The newest finished run of one trigger schedule, as seen by the selector.
#[derive(Debug, Clone)]
pub struct TriggerState {
    pub schedule_id: ScheduleId,
    pub latest_finished: Option<Execution>,
}

impl TriggerState {
    pub fn new(schedule_id: ScheduleId, latest_finished: Option<Execution>) -> Self {
        Self {
            schedule_id,
            latest_finished,
        }
    }
}

/// Is a follow-up schedule due, given its own last start and its triggers' history?
pub fn is_due(
    own_last_start: Option<DateTime<Utc>>,
    triggers: &[TriggerState],
    only_after_success: bool,
) -> bool {
    qualifying_trigger(own_last_start, triggers, only_after_success).is_some()
}

/// The first trigger whose latest finished run makes the follow-up due.
pub fn qualifying_trigger<'a>(
    own_last_start: Option<DateTime<Utc>>,
    triggers: &'a [TriggerState],
    only_after_success: bool,
) -> Option<&'a ScheduleId> {
    triggers
        .iter()
        .find(|trigger| {
            trigger
                .latest_finished
                .as_ref()
                .is_some_and(|run| counts(run, own_last_start, only_after_success))
        })
        .map(|trigger| &trigger.schedule_id)
}

fn counts(run: &Execution, own_last_start: Option<DateTime<Utc>>, only_after_success: bool) -> bool {
    if !run.is_finished() {
        return false;
    }
    // Failed runs are invisible to success-only followers: they neither
    // trigger nor consume anything.
    if only_after_success && !run.succeeded() {
        return false;
    }
    own_last_start.map_or(true, |own| whole_seconds(run.start_time) > whole_seconds(own))
}
