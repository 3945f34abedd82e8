//! Core configuration: lock pool sizing, timeouts and poison pill policy.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::TreeError;

/// Sizing of the multi-level lock pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockPoolConfig {
    /// Number of lock objects per level, lowest level first
    pub level_sizes: Vec<usize>,
    /// Whether the last level falls back to dynamic allocation when exhausted
    pub last_level_is_overflow: bool,
}

impl Default for LockPoolConfig {
    fn default() -> Self {
        Self {
            level_sizes: vec![1024, 4096, 16384],
            last_level_is_overflow: true,
        }
    }
}

/// Configuration of a namespace tree instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Lock pool sizing
    pub lock_pool: LockPoolConfig,
    /// How long a transaction waits for a single node lock
    pub lock_timeout_ms: u64,
    /// How long `lock_root` waits for in-flight commits to drain
    pub sync_barrier_timeout_ms: u64,
    /// Whether `unsafe_set_poison_pill` may mark nodes
    pub allow_poison_pills: bool,
    /// Name reported in logs and health descriptions
    pub replica_name: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            lock_pool: LockPoolConfig::default(),
            lock_timeout_ms: 5000,
            sync_barrier_timeout_ms: 20000,
            allow_poison_pills: false,
            replica_name: None,
        }
    }
}

impl CoreConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: CoreConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values the tree cannot run with.
    pub fn validate(&self) -> Result<(), TreeError> {
        if self.lock_pool.level_sizes.is_empty() {
            return Err(TreeError::Config(
                "lock_pool.level_sizes must not be empty".to_string(),
            ));
        }
        if let Some(i) = self.lock_pool.level_sizes.iter().position(|&s| s == 0) {
            return Err(TreeError::Config(format!(
                "lock_pool.level_sizes[{}] must be greater than zero",
                i
            )));
        }
        if self.lock_timeout_ms == 0 {
            return Err(TreeError::Config(
                "lock_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-node lock acquisition timeout
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Timeout of the commit drain barrier taken by `lock_root`
    pub fn sync_barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_barrier_timeout_ms)
    }

    /// Name used in logs, "nstree" when unset
    pub fn display_name(&self) -> &str {
        self.replica_name.as_deref().unwrap_or("nstree")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert_eq!(config.lock_pool.level_sizes, vec![1024, 4096, 16384]);
        assert!(config.lock_pool.last_level_is_overflow);
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert_eq!(config.sync_barrier_timeout(), Duration::from_secs(20));
        assert!(!config.allow_poison_pills);
        assert_eq!(config.display_name(), "nstree");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
lock_timeout_ms = 250
allow_poison_pills = true
replica_name = "replica-a"

[lock_pool]
level_sizes = [8, 16]
last_level_is_overflow = false
"#
        )
        .unwrap();

        let config = CoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.lock_timeout_ms, 250);
        assert_eq!(config.sync_barrier_timeout_ms, 20000);
        assert!(config.allow_poison_pills);
        assert_eq!(config.lock_pool.level_sizes, vec![8, 16]);
        assert!(!config.lock_pool.last_level_is_overflow);
        assert_eq!(config.display_name(), "replica-a");
    }

    #[test]
    fn test_from_json_file() {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"lock_timeout_ms": 100}}"#).unwrap();

        let config = CoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.lock_timeout_ms, 100);
        assert_eq!(config.lock_pool, LockPoolConfig::default());
    }

    #[test]
    fn test_unsupported_extension() {
        let file = Builder::new().suffix(".yaml").tempfile().unwrap();
        let err = CoreConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported"));
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"lock_pool": {{"level_sizes": []}}}}"#).unwrap();
        assert!(CoreConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_zero_level() {
        let mut config = CoreConfig::default();
        config.lock_pool.level_sizes = vec![4, 0];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, TreeError::Config(msg) if msg.contains("[1]")));
    }

    #[test]
    fn test_validate_zero_timeout() {
        let config = CoreConfig {
            lock_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
