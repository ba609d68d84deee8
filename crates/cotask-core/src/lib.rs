//! Background job scheduling with bounded concurrency.
//!
//! A [`Scheduler`] admits submitted futures immediately while it has spare
//! `limit` capacity, queues the rest up to `pending_limit`, and suspends any
//! caller beyond that until a slot frees. See `SPEC_FULL.md` for the full
//! contract.

pub mod config;
pub mod error;
pub mod job;
pub mod scheduler;

pub use config::SchedulerSettings;
pub use error::{Result, SchedulerError};
pub use job::{Job, JobId, JobState};
pub use scheduler::{ExceptionContext, ExceptionHandler, Scheduler};

/// Current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_available() {
        assert!(!VERSION.is_empty());
    }
}
