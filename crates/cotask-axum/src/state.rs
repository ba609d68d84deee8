//! Shared application state: one scheduler per running application.

use cotask_core::Scheduler;

/// Application state holding the process-wide scheduler.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
}

impl AppState {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }
}
