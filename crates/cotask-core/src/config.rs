//! Scheduler configuration.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! environment variables prefixed `COTASK_` (e.g. `COTASK_LIMIT=50`). This
//! mirrors the load-order the rest of the ecosystem uses for its own
//! `Config::load`, but goes through the `config` crate instead of a bare
//! `toml::from_str` so the environment layer actually exists.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SchedulerError};

/// Concurrency and timeout settings for a [`crate::Scheduler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Max simultaneously-active jobs. `None` disables admission pause.
    pub limit: Option<usize>,

    /// Capacity of the pending queue. `Some(0)` disables pending entirely,
    /// forcing spawners to wait. `None` means unbounded.
    pub pending_limit: Option<usize>,

    /// Per-job grace window on forced close, in milliseconds. `None` = no timeout.
    pub close_timeout_ms: Option<u64>,

    /// Upper bound for graceful `wait_and_close`, in milliseconds. `None` = no timeout.
    pub wait_timeout_ms: Option<u64>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            limit: Some(100),
            pending_limit: Some(10_000),
            close_timeout_ms: Some(100),
            wait_timeout_ms: Some(60_000),
        }
    }
}

impl SchedulerSettings {
    /// Load settings from a TOML file, with environment overrides applied on top.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let builder = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(config::Environment::with_prefix("COTASK"));

        let settings: Self = builder
            .build()
            .map_err(SchedulerError::from)?
            .try_deserialize()
            .map_err(SchedulerError::from)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from `./cotask.toml` if present, plus environment
    /// overrides, falling back to defaults when neither is available.
    pub fn load_default() -> Result<Self> {
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&Self::default()).map_err(SchedulerError::from)?,
        );

        if Path::new("./cotask.toml").exists() {
            builder = builder.add_source(config::File::with_name("cotask.toml"));
        }
        builder = builder.add_source(config::Environment::with_prefix("COTASK"));

        let settings: Self = builder
            .build()
            .map_err(SchedulerError::from)?
            .try_deserialize()
            .map_err(SchedulerError::from)?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn close_timeout(&self) -> Option<Duration> {
        self.close_timeout_ms.map(Duration::from_millis)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<()> {
        if self.limit == Some(0) {
            return Err(SchedulerError::configuration(
                "`limit` of 0 would admit no jobs at all; use `None` to disable the pause instead",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let settings = SchedulerSettings::default();
        assert_eq!(settings.limit, Some(100));
        assert_eq!(settings.pending_limit, Some(10_000));
        assert_eq!(settings.close_timeout(), Some(Duration::from_millis(100)));
        assert_eq!(settings.wait_timeout(), Some(Duration::from_millis(60_000)));
    }

    #[test]
    fn zero_limit_is_rejected() {
        let settings = SchedulerSettings {
            limit: Some(0),
            ..SchedulerSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn load_default_without_file_falls_back_to_defaults() {
        let settings = SchedulerSettings::load_default().expect("defaults should always load");
        assert_eq!(settings.limit, Some(100));
    }
}
