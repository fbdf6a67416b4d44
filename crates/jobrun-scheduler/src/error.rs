use thiserror::Error;

/// Errors that can occur within the scheduling subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cron token could not be parsed or has the wrong field count.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No job with the given id exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The concurrency cap is reached; the trigger was rejected.
    #[error("Concurrency cap reached ({running}/{max}) — try again later")]
    Backpressure { running: usize, max: usize },

    /// Underlying persistence failure.
    #[error(transparent)]
    Store(#[from] jobrun_store::StoreError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
