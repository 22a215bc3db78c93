//! Engine configuration
//!
//! Loaded from TOML; every field has a default so an empty document is a
//! valid configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub protection: ExecutionProtectionConfig,
    pub decision: DecisionConfig,
    pub capture: CaptureConfig,
}

impl ResilienceConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With repair budgets
    #[inline]
    #[must_use]
    pub fn with_protection(mut self, protection: ExecutionProtectionConfig) -> Self {
        self.protection = protection;
        self
    }

    /// With decision polling settings
    #[inline]
    #[must_use]
    pub fn with_decision(mut self, decision: DecisionConfig) -> Self {
        self.decision = decision;
        self
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` on bad syntax and `ConfigError::Invalid`
    /// when a value is out of range
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// Returns `ConfigError::Io` if the file cannot be read
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` describing the first bad value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.decision.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "decision.poll_interval_ms must be positive".into(),
            ));
        }
        if self.decision.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "decision.timeout_ms must be positive".into(),
            ));
        }
        if self.decision.poll_interval_ms > self.decision.timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "decision.poll_interval_ms ({}) exceeds decision.timeout_ms ({})",
                self.decision.poll_interval_ms, self.decision.timeout_ms
            )));
        }
        if self.capture.max_error_message_len == 0 {
            return Err(ConfigError::Invalid(
                "capture.max_error_message_len must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Repair budgets and early-stop switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionProtectionConfig {
    pub early_stop_on_non_recoverable: bool,
    pub max_repairs_per_step: u32,
    pub max_total_repairs: u32,
    /// Refuse repairs of `(step, category)` pairs that failed in a prior run
    pub check_identical_failures: bool,
    /// Prior-run failure rows loaded per execution
    pub prior_failure_lookback: usize,
}

impl Default for ExecutionProtectionConfig {
    fn default() -> Self {
        Self {
            early_stop_on_non_recoverable: true,
            max_repairs_per_step: 2,
            max_total_repairs: 5,
            check_identical_failures: true,
            prior_failure_lookback: 100,
        }
    }
}

/// Pause-for-human polling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub poll_interval_ms: u64,
    /// Both the local wait and the persisted `expires_at` use this bound
    pub timeout_ms: u64,
}

impl DecisionConfig {
    #[inline]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            timeout_ms: 10 * 60 * 1_000,
        }
    }
}

/// Failure snapshot capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub max_error_message_len: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_error_message_len: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = ResilienceConfig::new();
        assert!(config.protection.early_stop_on_non_recoverable);
        assert_eq!(config.protection.max_repairs_per_step, 2);
        assert_eq!(config.protection.max_total_repairs, 5);
        assert!(config.protection.check_identical_failures);
        assert_eq!(config.decision.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.decision.timeout(), Duration::from_secs(600));
        assert_eq!(config.capture.max_error_message_len, 1000);
    }

    #[test]
    fn empty_document_is_default() {
        let config = ResilienceConfig::from_toml_str("").unwrap();
        assert_eq!(config, ResilienceConfig::default());
    }

    #[test]
    fn partial_document_overrides_only_given_fields() {
        let config = ResilienceConfig::from_toml_str(
            r#"
            [protection]
            max_total_repairs = 9

            [decision]
            poll_interval_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.protection.max_total_repairs, 9);
        assert_eq!(config.protection.max_repairs_per_step, 2);
        assert_eq!(config.decision.poll_interval_ms, 1000);
        assert_eq!(config.decision.timeout_ms, 600_000);
    }

    #[test]
    fn poll_interval_longer_than_timeout_is_rejected() {
        let err = ResilienceConfig::from_toml_str(
            r#"
            [decision]
            poll_interval_ms = 10000
            timeout_ms = 5000
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn bad_syntax_is_a_parse_error() {
        let err = ResilienceConfig::from_toml_str("[protection").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[capture]\nmax_error_message_len = 200").unwrap();

        let config = ResilienceConfig::from_path(file.path()).unwrap();
        assert_eq!(config.capture.max_error_message_len, 200);
    }
}
