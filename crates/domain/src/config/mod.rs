mod refresh;
mod retry;
mod session;
mod storage;

pub use refresh::*;
pub use retry::*;
pub use session::*;
pub use storage::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::credentials::MAX_TOKEN_LIFETIME_SECS;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Parse a TOML document. Missing sections and fields take defaults.
    pub fn from_toml_str(s: &str) -> crate::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(config)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.session.device_id.is_empty() {
            errors.push(error("session.device_id", "device_id must not be empty"));
        }

        if self.session.tick_ms == 0 {
            errors.push(error("session.tick_ms", "tick_ms must be greater than 0"));
        } else if self.session.tick_ms > MAX_TICK_MS {
            errors.push(error(
                "session.tick_ms",
                &format!("tick_ms must be at most {MAX_TICK_MS}"),
            ));
        }

        if self.session.correlator_capacity == 0 {
            errors.push(error(
                "session.correlator_capacity",
                "correlator_capacity must be greater than 0",
            ));
        }

        for (field, ticks) in self.timeouts.named() {
            if ticks == 0 {
                errors.push(error(
                    &format!("timeouts.{field}"),
                    "initial timeout must be at least one tick",
                ));
            } else if ticks > MAX_TIMEOUT_TICKS {
                errors.push(error(
                    &format!("timeouts.{field}"),
                    &format!("initial timeout must be at most {MAX_TIMEOUT_TICKS} ticks"),
                ));
            }
        }

        for (field, ceiling) in [
            ("retry.sign_in_ceiling", self.retry.sign_in_ceiling),
            ("retry.publish_ceiling", self.retry.publish_ceiling),
            ("retry.refresh_ceiling", self.retry.refresh_ceiling),
            ("retry.discover_ceiling", self.retry.discover_ceiling),
        ] {
            if !(1..=MAX_CEILING).contains(&ceiling) {
                errors.push(error(
                    field,
                    &format!("ceiling multiplier must be between 1 and {MAX_CEILING}"),
                ));
            }
        }

        if self.retry.transport_retry_limit == 0 {
            errors.push(warning(
                "retry.transport_retry_limit",
                "transport failures will never be resent",
            ));
        }

        if !(self.backoff.jitter_span > 0.0) {
            errors.push(error("backoff.jitter_span", "jitter_span must be positive"));
        }

        if !(self.backoff.jitter_divisor > 0.0) {
            errors.push(error(
                "backoff.jitter_divisor",
                "jitter_divisor must be positive",
            ));
        }

        if self.backoff.max_draws == 0 {
            errors.push(error("backoff.max_draws", "max_draws must be greater than 0"));
        }

        if self.refresh.check_interval_secs == 0 {
            errors.push(error(
                "refresh.check_interval_secs",
                "check_interval_secs must be greater than 0",
            ));
        } else if self.refresh.check_interval_secs > MAX_CHECK_INTERVAL_SECS {
            errors.push(error(
                "refresh.check_interval_secs",
                &format!("check_interval_secs must be at most {MAX_CHECK_INTERVAL_SECS}"),
            ));
        }

        if self.refresh.expiry_margin_secs == 0 {
            errors.push(warning(
                "refresh.expiry_margin_secs",
                "tokens will only be refreshed after they have expired",
            ));
        } else if self.refresh.expiry_margin_secs > MAX_TOKEN_LIFETIME_SECS as u64 {
            errors.push(error(
                "refresh.expiry_margin_secs",
                "expiry_margin_secs exceeds the longest token lifetime",
            ));
        }

        if self.storage.credentials_path.as_os_str().is_empty() {
            errors.push(error(
                "storage.credentials_path",
                "credentials_path must not be empty",
            ));
        }

        errors
    }
}

fn error(field: &str, message: &str) -> ConfigError {
    ConfigError {
        severity: ConfigSeverity::Error,
        field: field.into(),
        message: message.into(),
    }
}

fn warning(field: &str, message: &str) -> ConfigError {
    ConfigError {
        severity: ConfigSeverity::Warning,
        field: field.into(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let issues = Config::default().validate();
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
    }

    #[test]
    fn zero_tick_is_an_error() {
        let mut config = Config::default();
        config.session.tick_ms = 0;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|e| e.field == "session.tick_ms" && e.severity == ConfigSeverity::Error));
    }

    #[test]
    fn zero_timeout_is_reported_per_stage() {
        let mut config = Config::default();
        config.timeouts.publish_ticks = 0;
        let issues = config.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "timeouts.publish_ticks");
    }

    #[test]
    fn nan_jitter_span_is_rejected() {
        let mut config = Config::default();
        config.backoff.jitter_span = f64::NAN;
        assert!(config
            .validate()
            .iter()
            .any(|e| e.field == "backoff.jitter_span"));
    }

    #[test]
    fn disabled_transport_retry_is_only_a_warning() {
        let mut config = Config::default();
        config.retry.transport_retry_limit = 0;
        let issues = config.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, ConfigSeverity::Warning);
    }

    #[test]
    fn oversized_values_are_errors() {
        let mut config = Config::default();
        config.session.tick_ms = u64::MAX;
        config.timeouts.sign_in_ticks = u32::MAX;
        config.retry.publish_ceiling = u32::MAX;
        config.refresh.check_interval_secs = u64::MAX;
        config.refresh.expiry_margin_secs = u64::MAX;
        let fields: Vec<_> = config
            .validate()
            .into_iter()
            .filter(|e| e.severity == ConfigSeverity::Error)
            .map(|e| e.field)
            .collect();
        assert_eq!(
            fields,
            [
                "session.tick_ms",
                "timeouts.sign_in_ticks",
                "retry.publish_ceiling",
                "refresh.check_interval_secs",
                "refresh.expiry_margin_secs",
            ]
        );
        assert_eq!(
            config.refresh.expiry_margin(),
            chrono::Duration::seconds(MAX_TOKEN_LIFETIME_SECS)
        );
    }

    #[test]
    fn display_includes_severity_tag() {
        let e = error("session.device_id", "device_id must not be empty");
        assert_eq!(
            e.to_string(),
            "[ERROR] session.device_id: device_id must not be empty"
        );
    }
}
