//! `cadence-scheduler`: schedule due-computation and execution coordination.
//!
//! # Overview
//!
//! The [`engine::SchedulerEngine`] ticks periodically, asks the
//! [`selector::ScheduleDueSelector`] which schedules are due, and hands each
//! one to the [`coordinator::ExecutionCoordinator`], which admits it against
//! the running registry and executes its task on a bounded worker pool.
//! Every admitted run is recorded as an [`types::Execution`] through a
//! [`store::ScheduleStore`].
//!
//! # Schedule variants
//!
//! | Variant    | Due when                                                     |
//! |------------|--------------------------------------------------------------|
//! | `Once`     | `now >= start` and the schedule has never run                |
//! | `Manual`   | never by scan; only through `execute_now`                    |
//! | `Interval` | inside `[start, end]` and one interval past the last run     |
//! | `FollowUp` | any trigger finished a run newer than our own last run       |
//!
//! # Concurrency rules
//!
//! - A schedule never runs twice at the same time.
//! - At most one non-parallel schedule runs at a time; parallel schedules
//!   are bounded only by the pool capacity.

pub mod coordinator;
pub mod db;
pub mod engine;
pub mod error;
pub mod follow_up;
pub mod interval;
pub mod lifecycle;
pub mod registry;
pub mod runner;
pub mod selector;
pub mod sqlite;
pub mod store;
pub mod truncate;
pub mod types;

pub use coordinator::{Admission, ExecutionCoordinator, RejectReason};
pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
pub use runner::{OutputSink, TaskFault, TaskRunner};
pub use selector::ScheduleDueSelector;
pub use sqlite::SqliteStore;
pub use store::{MemoryStore, ScheduleStore};
pub use types::{
    Execution, ExecutionOutcome, ExecutionReport, IntervalUnit, Schedule, ScheduleData, Task,
};
