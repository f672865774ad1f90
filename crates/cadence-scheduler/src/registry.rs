use std::collections::HashSet;

use cadence_core::ScheduleId;

/// In-flight bookkeeping for the coordinator.
///
/// Not synchronized on its own: the coordinator keeps it behind its single
/// admission lock, so every check-then-insert is atomic.
#[derive(Debug, Default)]
pub struct RunningRegistry {
    running: HashSet<ScheduleId>,
    /// Non-parallel schedules holding the slot, oldest first. Normal
    /// admission keeps at most one; recovered orphans may add more.
    non_parallel: Vec<ScheduleId>,
}

/// Why the registry refused a schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    AlreadyRunning,
    NonParallelSlotHeld { holder: ScheduleId },
}

impl RunningRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Would `schedule_id` be admitted right now?
    pub fn check(&self, schedule_id: &ScheduleId, parallel: bool) -> Result<(), Conflict> {
        if self.running.contains(schedule_id) {
            return Err(Conflict::AlreadyRunning);
        }
        if !parallel {
            if let Some(holder) = self.non_parallel.first() {
                return Err(Conflict::NonParallelSlotHeld {
                    holder: holder.clone(),
                });
            }
        }
        Ok(())
    }

    /// Record a run. Normal admission must have passed [`check`](Self::check)
    /// under the same lock; orphan recovery admits unchecked.
    pub fn admit(&mut self, schedule_id: &ScheduleId, parallel: bool) {
        if self.running.insert(schedule_id.clone()) && !parallel {
            self.non_parallel.push(schedule_id.clone());
        }
    }

    /// Forget a finished run. The slot frees once no non-parallel run remains.
    pub fn release(&mut self, schedule_id: &ScheduleId) {
        if self.running.remove(schedule_id) {
            self.non_parallel.retain(|id| id != schedule_id);
        }
    }

    pub fn contains(&self, schedule_id: &ScheduleId) -> bool {
        self.running.contains(schedule_id)
    }

    pub fn snapshot(&self) -> HashSet<ScheduleId> {
        self.running.clone()
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}
