//! Crate-wide error type.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors raised by the scheduler and its jobs.
///
/// Every failure path in the crate funnels into one of these variants; see
/// `SPEC_FULL.md` section 7 for the routing rules (explicit await vs.
/// exception-handler dispatch).
#[derive(Debug, Error, Clone)]
pub enum SchedulerError {
    /// Invalid configuration, or an operation attempted after the scheduler closed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The job's future returned an error or panicked.
    #[error("job failed: {0}")]
    JobFailure(String),

    /// A bounded wait (`close_timeout`, `wait_timeout`, or an explicit `wait(timeout)`) expired.
    #[error("operation timed out")]
    Timeout,

    /// A `spawn` caller parked on the waiting queue was cancelled before it could be admitted.
    #[error("spawn cancelled while waiting for admission")]
    Cancelled,
}

impl SchedulerError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        SchedulerError::Configuration(msg.into())
    }

    pub fn job_failure(msg: impl Into<String>) -> Self {
        SchedulerError::JobFailure(msg.into())
    }
}

impl From<config::ConfigError> for SchedulerError {
    fn from(err: config::ConfigError) -> Self {
        SchedulerError::Configuration(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SchedulerError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            SchedulerError::Cancelled
        } else {
            SchedulerError::JobFailure(err.to_string())
        }
    }
}
