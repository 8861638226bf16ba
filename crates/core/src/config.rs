use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Env var selecting the active profile.
pub const PROFILE_ENV: &str = "HOSTWATCH_PROFILE";

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read an env var, treating empty values as unset.
pub fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
pub fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

pub fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

/// Parse a profiled env var. Unparseable values are logged and ignored.
pub fn profiled_env_parse<T: FromStr>(profile: &str, key: &str) -> Option<T> {
    let raw = profiled_env_opt(profile, key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// The active profile name, upper-cased (empty = default).
pub fn active_profile() -> String {
    env_or(PROFILE_ENV, "").to_uppercase()
}

// ── Top-level config ──────────────────────────────────────────

/// Process-level settings shared by every hostwatch binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Active profile name (empty = default).
    pub profile: String,
    /// Fallback `tracing` filter when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Optional path to a scheduler TOML file.
    pub scheduler_config: Option<PathBuf>,
}

impl CoreConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `HOSTWATCH_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        Self::for_profile(&active_profile())
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            log_filter: profiled_env_or(p, "HOSTWATCH_LOG", "info"),
            scheduler_config: profiled_env_opt(p, "HOSTWATCH_SCHEDULER_CONFIG").map(PathBuf::from),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  log filter:  {}", self.log_filter);
        tracing::info!(
            "  scheduler:   config={}",
            self.scheduler_config
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(defaults)".to_string())
        );
    }

    /// Summary safe for rendering by status surfaces.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "log_filter": self.log_filter,
            "scheduler_config": self.scheduler_config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own key names; the process environment is shared.

    #[test]
    fn profiled_lookup_prefers_prefixed_key() {
        env::set_var("HWTEST_A_KEY", "plain");
        env::set_var("STAGING_HWTEST_A_KEY", "staged");
        assert_eq!(profiled_env_opt("STAGING", "HWTEST_A_KEY").as_deref(), Some("staged"));
        assert_eq!(profiled_env_opt("", "HWTEST_A_KEY").as_deref(), Some("plain"));
        assert_eq!(profiled_env_opt("OTHER", "HWTEST_A_KEY").as_deref(), Some("plain"));
    }

    #[test]
    fn empty_values_are_unset() {
        env::set_var("HWTEST_EMPTY", "");
        assert!(env_opt("HWTEST_EMPTY").is_none());
        assert_eq!(profiled_env_or("", "HWTEST_EMPTY", "fallback"), "fallback");
    }

    #[test]
    fn parse_ignores_garbage() {
        env::set_var("HWTEST_NUM", "12");
        env::set_var("HWTEST_BAD_NUM", "twelve");
        assert_eq!(profiled_env_parse::<u32>("", "HWTEST_NUM"), Some(12));
        assert_eq!(profiled_env_parse::<u32>("", "HWTEST_BAD_NUM"), None);
    }

    #[test]
    fn profile_label_defaults() {
        let config = CoreConfig {
            profile: String::new(),
            log_filter: "info".into(),
            scheduler_config: None,
        };
        assert_eq!(config.profile_label(), "default");
        assert_eq!(config.summary()["profile"], "default");
    }
}
