// SPDX-License-Identifier: PMPL-1.0-or-later
//! Runtime configuration.
//!
//! Defaults, optionally overlaid by a JSON file named in `BISTORE_CONFIG`,
//! then by individual `BISTORE_*` environment variables.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use bistore_errors::{ClassifierConfig, RetryPolicy};
use bistore_pool::PoolConfig;
use bistore_txn::CoordinatorConfig;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// HTTP listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Who replays recovery tickets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Only through `POST /recovery/{ticket}/replay`.
    #[default]
    Manual,
    /// In the background, with bounded attempts.
    Automatic { backoff: RetryPolicy },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BistoreConfig {
    pub api: ApiConfig,
    pub graph_pool: PoolConfig,
    pub relational_pool: PoolConfig,
    pub coordinator: CoordinatorConfig,
    pub classifier: ClassifierConfig,
    pub recovery: RecoveryMode,
    /// Directory for redb files; memory only when unset.
    pub data_dir: Option<PathBuf>,
    /// Error records kept by the recovery coordinator.
    pub error_log_capacity: usize,
    /// Window for the reported error rate.
    pub metrics_window_secs: u64,
}

impl Default for BistoreConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            graph_pool: PoolConfig::named("graph"),
            relational_pool: PoolConfig::named("relational"),
            coordinator: CoordinatorConfig::default(),
            classifier: ClassifierConfig::default(),
            recovery: RecoveryMode::Manual,
            data_dir: None,
            error_log_capacity: 10_000,
            metrics_window_secs: 300,
        }
    }
}

impl BistoreConfig {
    /// Configuration from the process environment.
    pub fn from_env() -> Result<Self, ApiError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ApiError> {
        let mut config = match lookup("BISTORE_CONFIG") {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        if let Some(host) = lookup("BISTORE_HOST") {
            config.api.host = host;
        }
        if let Some(port) = lookup("BISTORE_PORT") {
            config.api.port = parse("BISTORE_PORT", &port)?;
        }
        if let Some(dir) = lookup("BISTORE_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(min) = lookup("BISTORE_POOL_MIN_SIZE") {
            let min = parse("BISTORE_POOL_MIN_SIZE", &min)?;
            config.graph_pool.min_size = min;
            config.relational_pool.min_size = min;
        }
        if let Some(max) = lookup("BISTORE_POOL_MAX_SIZE") {
            let max = parse("BISTORE_POOL_MAX_SIZE", &max)?;
            config.graph_pool.max_size = max;
            config.relational_pool.max_size = max;
        }
        if let Some(ms) = lookup("BISTORE_PREPARE_TIMEOUT_MS") {
            config.coordinator.prepare_timeout_ms = parse("BISTORE_PREPARE_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("BISTORE_COMMIT_TIMEOUT_MS") {
            config.coordinator.commit_timeout_ms = parse("BISTORE_COMMIT_TIMEOUT_MS", &ms)?;
        }
        if let Some(mode) = lookup("BISTORE_RECOVERY") {
            config.recovery = match mode.as_str() {
                "manual" => RecoveryMode::Manual,
                "automatic" => RecoveryMode::Automatic {
                    backoff: RetryPolicy::default(),
                },
                other => {
                    return Err(ApiError::Config(format!(
                        "BISTORE_RECOVERY must be 'manual' or 'automatic', got '{other}'"
                    )))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ApiError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ApiError::Config(format!("cannot read {path}: {e}")))?;
        serde_json::from_str(&raw).map_err(|e| ApiError::Config(format!("{path}: {e}")))
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        self.graph_pool
            .validate()
            .and_then(|_| self.relational_pool.validate())
            .map_err(|e| ApiError::Config(e.to_string()))?;
        if self.coordinator.prepare_timeout_ms == 0 || self.coordinator.commit_timeout_ms == 0 {
            return Err(ApiError::Config(
                "prepare and commit timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ApiError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| ApiError::Config(format!("{key}='{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = BistoreConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.api, ApiConfig::default());
        assert_eq!(config.graph_pool.name, "graph");
        assert_eq!(config.recovery, RecoveryMode::Manual);
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_environment_overrides() {
        let config = BistoreConfig::from_lookup(lookup(&[
            ("BISTORE_PORT", "9090"),
            ("BISTORE_POOL_MIN_SIZE", "1"),
            ("BISTORE_POOL_MAX_SIZE", "3"),
            ("BISTORE_RECOVERY", "automatic"),
        ]))
        .unwrap();
        assert_eq!(config.api.port, 9090);
        assert_eq!(config.relational_pool.max_size, 3);
        assert_eq!(config.graph_pool.min_size, 1);
        assert!(matches!(config.recovery, RecoveryMode::Automatic { .. }));
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        let err = BistoreConfig::from_lookup(lookup(&[("BISTORE_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ApiError::Config(_)));

        let err = BistoreConfig::from_lookup(lookup(&[
            ("BISTORE_POOL_MIN_SIZE", "5"),
            ("BISTORE_POOL_MAX_SIZE", "2"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ApiError::Config(_)));
    }

    #[test]
    fn test_config_file_is_overlaid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bistore.json");
        std::fs::write(
            &path,
            r#"{"api": {"port": 7000}, "coordinator": {"prepare_timeout_ms": 750}}"#,
        )
        .unwrap();

        let path = path.to_string_lossy().to_string();
        let config = BistoreConfig::from_lookup(lookup(&[
            ("BISTORE_CONFIG", path.as_str()),
            ("BISTORE_HOST", "127.0.0.1"),
        ]))
        .unwrap();
        assert_eq!(config.api.port, 7000);
        assert_eq!(config.api.host, "127.0.0.1");
        assert_eq!(config.coordinator.prepare_timeout_ms, 750);
        assert_eq!(config.coordinator.commit_timeout_ms, 5_000);
    }
}
