//! Worker pool and admission suspension.
//!
//! The pool is a tokio runtime handle plus a semaphore sized to the configured
//! worker count. A run holds one owned permit for its whole lifetime, so
//! recreating the pool never disturbs runs already in flight: they keep the
//! permit of the pool that admitted them.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use cadence_core::ScheduleId;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::info;

pub struct WorkerPool {
    permits: Arc<Semaphore>,
    capacity: usize,
    generation: u64,
    runtime: Handle,
}

impl WorkerPool {
    pub fn new(capacity: usize, runtime: Handle, generation: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            generation,
            runtime,
        }
    }

    /// A closed pool admits nothing until it is recreated.
    pub fn is_alive(&self) -> bool {
        !self.permits.is_closed()
    }

    /// Claim one worker slot without waiting.
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    pub fn spawn<F>(&self, work: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(work)
    }

    /// Stop admitting. Permits already handed out stay valid.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Whether admission is paused, and for whom it is not.
#[derive(Debug, Default)]
pub struct Suspension {
    active: bool,
    exempt: HashSet<ScheduleId>,
}

impl Suspension {
    pub fn suspend(&mut self, exempt: HashSet<ScheduleId>) {
        self.active = true;
        self.exempt = exempt;
    }

    pub fn resume(&mut self) {
        self.active = false;
        self.exempt.clear();
    }

    pub fn is_suspended(&self) -> bool {
        self.active
    }

    pub fn allows(&self, schedule_id: &ScheduleId) -> bool {
        !self.active || self.exempt.contains(schedule_id)
    }
}

/// Owns the current pool and the suspension flag.
pub struct ExecutorLifecycle {
    pool: WorkerPool,
    runtime: Handle,
    suspension: Suspension,
}

impl ExecutorLifecycle {
    pub fn new(capacity: usize, runtime: Handle) -> Self {
        Self {
            pool: WorkerPool::new(capacity, runtime.clone(), 0),
            runtime,
            suspension: Suspension::default(),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn suspension(&self) -> &Suspension {
        &self.suspension
    }

    pub fn suspension_mut(&mut self) -> &mut Suspension {
        &mut self.suspension
    }

    /// Make sure a live pool exists. Returns `true` if it was usable already
    /// or has been recreated. `capacity` applies only to a new pool.
    pub fn ensure_pool(&mut self, force_restart: bool, capacity: usize) -> bool {
        if self.pool.is_alive() && !force_restart {
            return true;
        }
        let was_alive = self.pool.is_alive();
        self.pool.close();

        let generation = self.pool.generation() + 1;
        self.pool = WorkerPool::new(capacity, self.runtime.clone(), generation);
        info!(
            generation,
            capacity = self.pool.capacity(),
            forced = force_restart,
            was_alive,
            "worker pool recreated"
        );
        self.pool.is_alive()
    }
}
