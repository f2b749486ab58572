//! Service configuration, loadable from TOML.
//!
//! Every key is optional:
//!
//! ```toml
//! token_limit = 3000
//! token_timeout_secs = 180
//! sweep_interval_ms = 1000
//! log_filter = "info"
//! ```

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use txlink_core::ClaimConfig;

/// Default interval between timeout sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Configuration for a [`TransactionService`](crate::TransactionService).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Applied to every transaction the service begins.
    pub claims: ClaimConfig,

    /// How often the reaper sweeps running transactions for timed-out
    /// tokens.
    pub sweep_interval: Duration,

    /// `EnvFilter` directives used by [`init_logging`](crate::init_logging)
    /// when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            claims: ClaimConfig::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// On-disk shape. Missing keys fall back to [`ServiceConfig::default`].
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    token_limit: Option<usize>,
    token_timeout_secs: Option<u64>,
    sweep_interval_ms: Option<u64>,
    log_filter: Option<String>,
}

impl ServiceConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML config text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(content)?;
        let defaults = Self::default();

        let config = Self {
            claims: ClaimConfig {
                token_limit: file.token_limit.unwrap_or(defaults.claims.token_limit),
                token_timeout: file
                    .token_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.claims.token_timeout),
            },
            sweep_interval: file
                .sweep_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
            log_filter: file.log_filter.unwrap_or(defaults.log_filter),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.claims.token_limit == 0 {
            return Err(ConfigError::Invalid(
                "token_limit must be at least 1".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sweep_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the claim limits applied to each transaction.
    pub fn with_claims(mut self, claims: ClaimConfig) -> Self {
        self.claims = claims;
        self
    }

    /// Set the reaper's sweep interval.
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use txlink_core::{DEFAULT_TOKEN_LIMIT, DEFAULT_TOKEN_TIMEOUT};

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ServiceConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.claims.token_limit, DEFAULT_TOKEN_LIMIT);
        assert_eq!(config.claims.token_timeout, DEFAULT_TOKEN_TIMEOUT);
    }

    #[test]
    fn test_partial_file() {
        let config = ServiceConfig::from_toml_str(
            r#"
            token_timeout_secs = 30
            log_filter = "txlink_core=trace"
            "#,
        )
        .unwrap();
        assert_eq!(config.claims.token_limit, DEFAULT_TOKEN_LIMIT);
        assert_eq!(config.claims.token_timeout, Duration::from_secs(30));
        assert_eq!(config.sweep_interval, DEFAULT_SWEEP_INTERVAL);
        assert_eq!(config.log_filter, "txlink_core=trace");
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(matches!(
            ServiceConfig::from_toml_str("token_limit = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServiceConfig::from_toml_str("sweep_interval_ms = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(matches!(
            ServiceConfig::from_toml_str("token_limt = 5"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ServiceConfig::from_toml_str("token_limit = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "token_limit = 10").unwrap();
        writeln!(file, "sweep_interval_ms = 250").unwrap();

        let config = ServiceConfig::load(file.path()).unwrap();
        assert_eq!(config.claims.token_limit, 10);
        assert_eq!(config.sweep_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServiceConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("absent.toml"));
    }
}
