use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hostwatch_core::config::profiled_env_parse;

use crate::error::SchedulerError;

/// Scheduler configuration, typically parsed from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker pool size. 0 = min(32, cpus + 4).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Upper bound between dispatch cycles when nothing wakes the dispatcher.
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_ms: u64,
    /// How often the execution guard re-checks cancellation.
    #[serde(default = "default_guard_poll")]
    pub guard_poll_interval_ms: u64,
    /// Poll slice used by `wait_for_task`.
    #[serde(default = "default_wait_poll")]
    pub wait_poll_interval_ms: u64,
    /// Maximum number of retained task results.
    #[serde(default = "default_completed_capacity")]
    pub completed_capacity: usize,
    /// Finished tasks included in `get_all_tasks` listings.
    #[serde(default = "default_listing_limit")]
    pub listing_limit: usize,
    /// Timeout applied to tasks built without an explicit one.
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    /// Base delay between retry attempts (doubles each attempt).
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_max_workers() -> usize { 0 }
fn default_dispatch_interval() -> u64 { 100 }
fn default_guard_poll() -> u64 { 100 }
fn default_wait_poll() -> u64 { 100 }
fn default_completed_capacity() -> usize { 1000 }
fn default_listing_limit() -> usize { 100 }
fn default_timeout() -> u64 { 60 }
fn default_retry_backoff() -> u64 { 1000 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            dispatch_interval_ms: default_dispatch_interval(),
            guard_poll_interval_ms: default_guard_poll(),
            wait_poll_interval_ms: default_wait_poll(),
            completed_capacity: default_completed_capacity(),
            listing_limit: default_listing_limit(),
            default_timeout_secs: default_timeout(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl SchedulerConfig {
    /// Parse config from a TOML string, then apply env overrides for
    /// `profile` and validate.
    pub fn from_toml(toml_str: &str, profile: &str) -> Result<Self, SchedulerError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides(profile);
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>, profile: &str) -> Result<Self, SchedulerError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content, profile)
    }

    /// Defaults plus env overrides for the given profile.
    pub fn from_env(profile: &str) -> Result<Self, SchedulerError> {
        let mut config = Self::default();
        config.apply_env_overrides(profile);
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `HOSTWATCH_SCHEDULER_KEY` overrides `key`, e.g.
    /// `HOSTWATCH_SCHEDULER_MAX_WORKERS` -> `max_workers`. Profiled keys
    /// (`{PROFILE}_HOSTWATCH_SCHEDULER_KEY`) take precedence.
    pub fn apply_env_overrides(&mut self, profile: &str) {
        let p = profile;
        if let Some(v) = profiled_env_parse(p, "HOSTWATCH_SCHEDULER_MAX_WORKERS") {
            self.max_workers = v;
        }
        if let Some(v) = profiled_env_parse(p, "HOSTWATCH_SCHEDULER_DISPATCH_INTERVAL_MS") {
            self.dispatch_interval_ms = v;
        }
        if let Some(v) = profiled_env_parse(p, "HOSTWATCH_SCHEDULER_GUARD_POLL_INTERVAL_MS") {
            self.guard_poll_interval_ms = v;
        }
        if let Some(v) = profiled_env_parse(p, "HOSTWATCH_SCHEDULER_WAIT_POLL_INTERVAL_MS") {
            self.wait_poll_interval_ms = v;
        }
        if let Some(v) = profiled_env_parse(p, "HOSTWATCH_SCHEDULER_COMPLETED_CAPACITY") {
            self.completed_capacity = v;
        }
        if let Some(v) = profiled_env_parse(p, "HOSTWATCH_SCHEDULER_LISTING_LIMIT") {
            self.listing_limit = v;
        }
        if let Some(v) = profiled_env_parse(p, "HOSTWATCH_SCHEDULER_DEFAULT_TIMEOUT_SECS") {
            self.default_timeout_secs = v;
        }
        if let Some(v) = profiled_env_parse(p, "HOSTWATCH_SCHEDULER_RETRY_BACKOFF_MS") {
            self.retry_backoff_ms = v;
        }
    }

    /// Reject values that would stall the scheduler.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.dispatch_interval_ms == 0 {
            return Err(SchedulerError::Config("dispatch_interval_ms must be > 0".into()));
        }
        if self.guard_poll_interval_ms == 0 {
            return Err(SchedulerError::Config("guard_poll_interval_ms must be > 0".into()));
        }
        if self.wait_poll_interval_ms == 0 {
            return Err(SchedulerError::Config("wait_poll_interval_ms must be > 0".into()));
        }
        if self.completed_capacity == 0 {
            return Err(SchedulerError::Config("completed_capacity must be > 0".into()));
        }
        if self.default_timeout_secs == 0 {
            return Err(SchedulerError::Config("default_timeout_secs must be > 0".into()));
        }
        Ok(())
    }

    /// Resolve worker count (0 means min(32, available parallelism + 4)).
    pub fn resolved_max_workers(&self) -> usize {
        if self.max_workers == 0 {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            (cpus + 4).min(32)
        } else {
            self.max_workers
        }
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn guard_poll_interval(&self) -> Duration {
        Duration::from_millis(self.guard_poll_interval_ms)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
