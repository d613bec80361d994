use std::time::Duration;

use crate::model::{Ms, MINUTE_MS};

/// Gates the auto-release sweeper. Loaded once and passed by value into
/// every sweep, so tests can inject a policy instead of poking a global
/// settings store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasePolicy {
    pub enabled: bool,
    /// Minutes after booking start before a no-show is released.
    pub grace_minutes: i64,
}

impl ReleasePolicy {
    pub fn grace_ms(&self) -> Ms {
        self.grace_minutes * MINUTE_MS
    }

    /// A disabled flag or a non-positive grace both turn the sweep off.
    pub fn is_active(&self) -> bool {
        self.enabled && self.grace_minutes > 0
    }
}

impl Default for ReleasePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            grace_minutes: 30,
        }
    }
}

/// How far ahead the recurrence expander materializes bookings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpandPolicy {
    pub horizon_days: i64,
}

impl Default for ExpandPolicy {
    fn default() -> Self {
        Self { horizon_days: 7 }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: String,
    pub api_token: Option<String>,
    pub metrics_port: Option<u16>,
    pub release: ReleasePolicy,
    pub expand: ExpandPolicy,
    pub sweep_interval: Duration,
    pub expand_interval: Duration,
    /// WAL appends between background rewrites.
    pub compact_threshold: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse from an arbitrary key lookup. `from_env` delegates here so
    /// tests never have to mutate process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            bind: get("PARKD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&get, "PARKD_PORT").unwrap_or(8080),
            data_dir: get("PARKD_DATA_DIR").unwrap_or_else(|| "./data".into()),
            api_token: get("PARKD_API_TOKEN").filter(|t| !t.is_empty()),
            metrics_port: parse(&get, "PARKD_METRICS_PORT"),
            release: ReleasePolicy {
                enabled: parse(&get, "PARKD_AUTO_RELEASE_ENABLED").unwrap_or(true),
                grace_minutes: parse(&get, "PARKD_AUTO_RELEASE_MINUTES").unwrap_or(30),
            },
            expand: ExpandPolicy {
                horizon_days: parse(&get, "PARKD_EXPAND_HORIZON_DAYS").unwrap_or(7),
            },
            sweep_interval: Duration::from_secs(
                parse(&get, "PARKD_SWEEP_INTERVAL_SECS").unwrap_or(60),
            ),
            expand_interval: Duration::from_secs(
                parse(&get, "PARKD_EXPAND_INTERVAL_SECS").unwrap_or(3600),
            ),
            compact_threshold: parse(&get, "PARKD_COMPACT_THRESHOLD").unwrap_or(1000),
        }
    }
}

/// Unreadable or unparsable values fall back to the per-key default.
fn parse<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_set() {
        let cfg = Config::from_lookup(|_| None);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.release, ReleasePolicy { enabled: true, grace_minutes: 30 });
        assert_eq!(cfg.expand.horizon_days, 7);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(60));
        assert!(cfg.api_token.is_none());
        assert!(cfg.metrics_port.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = Config::from_lookup(|key| match key {
            "PARKD_PORT" => Some("9090".into()),
            "PARKD_AUTO_RELEASE_ENABLED" => Some("false".into()),
            "PARKD_AUTO_RELEASE_MINUTES" => Some("15".into()),
            "PARKD_API_TOKEN" => Some("s3cret".into()),
            _ => None,
        });
        assert_eq!(cfg.port, 9090);
        assert!(!cfg.release.enabled);
        assert_eq!(cfg.release.grace_minutes, 15);
        assert_eq!(cfg.api_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn every_typed_key_parses() {
        let cfg = Config::from_lookup(|key| match key {
            "PARKD_PORT" => Some("9090".into()),
            "PARKD_METRICS_PORT" => Some("9100".into()),
            "PARKD_AUTO_RELEASE_ENABLED" => Some("false".into()),
            "PARKD_AUTO_RELEASE_MINUTES" => Some("45".into()),
            "PARKD_EXPAND_HORIZON_DAYS" => Some("14".into()),
            "PARKD_SWEEP_INTERVAL_SECS" => Some("5".into()),
            "PARKD_EXPAND_INTERVAL_SECS" => Some("120".into()),
            "PARKD_COMPACT_THRESHOLD" => Some("250".into()),
            _ => None,
        });
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.metrics_port, Some(9100));
        assert!(!cfg.release.enabled);
        assert_eq!(cfg.release.grace_minutes, 45);
        assert_eq!(cfg.expand.horizon_days, 14);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(5));
        assert_eq!(cfg.expand_interval, Duration::from_secs(120));
        assert_eq!(cfg.compact_threshold, 250);
    }

    #[test]
    fn garbage_values_fall_back_to_defaults() {
        let cfg = Config::from_lookup(|key| match key {
            "PARKD_PORT" => Some("not-a-port".into()),
            "PARKD_API_TOKEN" => Some("".into()),
            _ => None,
        });
        assert_eq!(cfg.port, 8080);
        assert!(cfg.api_token.is_none());
    }

    #[test]
    fn release_policy_active() {
        assert!(ReleasePolicy { enabled: true, grace_minutes: 30 }.is_active());
        assert!(!ReleasePolicy { enabled: false, grace_minutes: 30 }.is_active());
        assert!(!ReleasePolicy { enabled: true, grace_minutes: 0 }.is_active());
        assert_eq!(ReleasePolicy { enabled: true, grace_minutes: 30 }.grace_ms(), 1_800_000);
    }
}
