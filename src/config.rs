//! Service configuration
//!
//! Loaded from TOML with per-section defaults; the deployment-critical
//! values (coordination store URL, database path) can also be overridden
//! through the environment so replicas ship one file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub locks: LockConfig,
    pub storage: StorageConfig,
    pub scenarios: ScenarioConfig,
}

/// Which lock backend replicas coordinate through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackend {
    /// In-process locks; valid only for single-replica deployments
    #[default]
    Local,
    /// Distributed locks over the shared coordination store
    Redis,
}

/// Locking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub backend: LockBackend,
    /// Coordination store URL (redis backend only)
    pub redis_url: String,
    /// How long an acquisition may wait before surfacing "lock unavailable"
    pub acquire_timeout_secs: u64,
    /// Lease TTL bounding the blast radius of a crashed replica
    pub lease_ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::Local,
            redis_url: "redis://127.0.0.1/".to_string(),
            acquire_timeout_secs: 60,
            lease_ttl_secs: 30,
        }
    }
}

impl LockConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("instancer.db"),
        }
    }
}

/// Scenario configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Root directory challenge scenario directories resolve under
    pub root: PathBuf,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("scenarios"),
        }
    }
}

impl ServiceConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: ServiceConfig = toml::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `INSTANCER_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("INSTANCER_REDIS_URL") {
            self.locks.backend = LockBackend::Redis;
            self.locks.redis_url = url;
        }
        if let Ok(path) = std::env::var("INSTANCER_DATABASE_PATH") {
            self.storage.database_path = PathBuf::from(path);
        }
        if let Ok(root) = std::env::var("INSTANCER_SCENARIO_ROOT") {
            self.scenarios.root = PathBuf::from(root);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.locks.lease_ttl_secs == 0 {
            anyhow::bail!("locks.lease_ttl_secs must be at least 1");
        }
        if self.locks.acquire_timeout_secs == 0 {
            anyhow::bail!("locks.acquire_timeout_secs must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.locks.backend, LockBackend::Local);
        assert_eq!(config.locks.acquire_timeout(), Duration::from_secs(60));
        assert_eq!(config.storage.database_path, PathBuf::from("instancer.db"));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: ServiceConfig = toml::from_str(
            r#"
[locks]
backend = "redis"
redis_url = "redis://coordination:6379/"
lease_ttl_secs = 15
"#,
        )
        .unwrap();
        assert_eq!(config.locks.backend, LockBackend::Redis);
        assert_eq!(config.locks.redis_url, "redis://coordination:6379/");
        assert_eq!(config.locks.lease_ttl(), Duration::from_secs(15));
        // Untouched sections keep their defaults
        assert_eq!(config.scenarios.root, PathBuf::from("scenarios"));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("INSTANCER_REDIS_URL", "redis://override:6379/");
        let mut config = ServiceConfig::default();
        config.apply_env();
        std::env::remove_var("INSTANCER_REDIS_URL");

        assert_eq!(config.locks.backend, LockBackend::Redis);
        assert_eq!(config.locks.redis_url, "redis://override:6379/");
    }

    #[test]
    fn test_validate_rejects_zero_lease() {
        let mut config = ServiceConfig::default();
        config.locks.lease_ttl_secs = 0;
        assert!(config.validate().is_err());
    }
}
