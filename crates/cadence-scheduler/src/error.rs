use thiserror::Error;

/// Errors that can occur within the scheduling engine.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A persisted value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The schedule definition cannot be evaluated (zero interval, overflow, …).
    #[error("Invalid schedule {id}: {reason}")]
    InvalidSchedule { id: String, reason: String },

    /// No schedule with the given ID exists in the store.
    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: String },

    /// No execution with the given ID exists in the store.
    #[error("Execution not found: {id}")]
    ExecutionNotFound { id: String },

    /// A store-internal lock was poisoned by a panicking thread.
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    /// The engine was constructed outside a tokio runtime.
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    /// Engine configuration could not be applied.
    #[error("Configuration error: {0}")]
    Config(#[from] cadence_core::CadenceError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
