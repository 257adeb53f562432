//! Configuration for the propagator.
//!
//! Read once at startup and shared read-only for the process lifetime.

use std::time::Duration;

use anyhow::Result;
use propagator_reconcile::{RetryPolicy, DEFAULT_ATTEMPTS};
use tracing::info;

use crate::templates::TemplateConfig;

pub const RETRY_ATTEMPTS_ENV: &str = "CONTROLLER_CONFIG_RETRY_ATTEMPTS";
pub const REQUEUE_ERROR_DELAY_ENV: &str = "CONTROLLER_CONFIG_REQUEUE_ERROR_DELAY";

/// Default minutes to wait before reconciling a root policy that failed.
const DEFAULT_REQUEUE_ERROR_DELAY_MINUTES: u64 = 5;
const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 60;

/// Propagator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Retry policy applied to every remote store call.
    pub retry: RetryPolicy,

    /// Delay before a failed root policy is reconciled again.
    pub requeue_error_delay: Duration,

    /// Interval between worker passes.
    pub resync_interval: Duration,

    /// Hub template settings.
    pub templates: TemplateConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON.
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            requeue_error_delay: Duration::from_secs(DEFAULT_REQUEUE_ERROR_DELAY_MINUTES * 60),
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS),
            templates: TemplateConfig::default(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_lookup(|name| std::env::var(name).ok()))
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let attempts = positive_int(&lookup, RETRY_ATTEMPTS_ENV, u64::from(DEFAULT_ATTEMPTS));
        let requeue_minutes = positive_int(
            &lookup,
            REQUEUE_ERROR_DELAY_ENV,
            DEFAULT_REQUEUE_ERROR_DELAY_MINUTES,
        );

        let resync_interval = Duration::from_secs(positive_int(
            &lookup,
            "PROPAGATOR_RESYNC_INTERVAL",
            DEFAULT_RESYNC_INTERVAL_SECS,
        ));

        let log_level = lookup("PROPAGATOR_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let log_json = lookup("PROPAGATOR_LOG_JSON")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            retry: RetryPolicy::with_attempts(u32::try_from(attempts).unwrap_or(u32::MAX)),
            requeue_error_delay: Duration::from_secs(requeue_minutes.saturating_mul(60)),
            resync_interval,
            templates: TemplateConfig::default(),
            log_level,
            log_json,
        }
    }
}

/// Read a positive integer, falling back to `default` when unset or invalid.
fn positive_int<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name).filter(|v| !v.is_empty()) else {
        return default;
    };

    match raw.parse::<u64>() {
        Ok(value) if value > 0 => value,
        _ => {
            info!("The {name} environment variable is invalid. Using default.");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[]));
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.requeue_error_delay, Duration::from_secs(300));
        assert_eq!(config.templates.start_delim, "{{hub");
        assert_eq!(config.log_level, "info");
        assert!(!config.log_json);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            (RETRY_ATTEMPTS_ENV, "7"),
            (REQUEUE_ERROR_DELAY_ENV, "2"),
            ("PROPAGATOR_RESYNC_INTERVAL", "15"),
            ("PROPAGATOR_LOG_JSON", "true"),
        ]));
        assert_eq!(config.retry.attempts, 7);
        assert_eq!(config.requeue_error_delay, Duration::from_secs(120));
        assert_eq!(config.resync_interval, Duration::from_secs(15));
        assert!(config.log_json);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = Config::from_lookup(lookup_from(&[
            (RETRY_ATTEMPTS_ENV, "0"),
            (REQUEUE_ERROR_DELAY_ENV, "soon"),
            ("PROPAGATOR_RESYNC_INTERVAL", "0"),
        ]));
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.requeue_error_delay, Duration::from_secs(300));
        assert_eq!(
            config.resync_interval,
            Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS)
        );
    }
}
