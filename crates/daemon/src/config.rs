// SSH Relay - Runner Config Module
// Settings for the top-level run (runner.toml). The connection descriptor and
// the mapping store live in ssh-relay-common.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use ssh_relay_core::orchestrator::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BACKOFF, DEFAULT_STAGGER};
use ssh_relay_core::OrchestratorPolicy;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Check every bind port for a zombie binding before starting tunnels
    #[serde(default = "default_preflight")]
    pub preflight_zombie_check: bool,

    /// Concurrent relays per tunnel (0 = unbounded)
    #[serde(default)]
    pub max_connections: usize,

    /// Start attempts per mapping, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// Pause between two mappings
    #[serde(default = "default_stagger_secs")]
    pub stagger_secs: u64,
}

fn default_preflight() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_retry_backoff_secs() -> u64 {
    DEFAULT_RETRY_BACKOFF.as_secs()
}

fn default_stagger_secs() -> u64 {
    DEFAULT_STAGGER.as_secs()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            preflight_zombie_check: default_preflight(),
            max_connections: 0,
            max_attempts: default_max_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            stagger_secs: default_stagger_secs(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        Ok(())
    }

    /// Load runner settings; a missing file means defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(
                "No runner configuration at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents =
            fs::read_to_string(path).context("Failed to read runner configuration")?;
        let config: Self =
            toml::from_str(&contents).context("Failed to parse runner configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded runner configuration from: {}", path.display());
        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(ssh_relay_common::config_dir()?.join("runner.toml"))
    }

    pub fn policy(&self) -> OrchestratorPolicy {
        OrchestratorPolicy {
            max_attempts: self.max_attempts,
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
            stagger: Duration::from_secs(self.stagger_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = RunnerConfig::load_from(&dir.path().join("runner.toml")).unwrap();
        assert_eq!(config, RunnerConfig::default());
        assert!(config.preflight_zombie_check);
        assert_eq!(config.max_connections, 0);
        assert_eq!(config.policy(), OrchestratorPolicy::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runner.toml");
        fs::write(&path, "preflight_zombie_check = false\nstagger_secs = 3\n").unwrap();

        let config = RunnerConfig::load_from(&path).unwrap();
        assert!(!config.preflight_zombie_check);
        assert_eq!(config.max_attempts, 3);

        let policy = config.policy();
        assert_eq!(policy.stagger, Duration::from_secs(3));
        assert_eq!(policy.retry_backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runner.toml");
        fs::write(&path, "max_attempts = 0\n").unwrap();

        let err = RunnerConfig::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("max_attempts"));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runner.toml");
        fs::write(&path, "max_connections = \"lots\"\n").unwrap();

        assert!(RunnerConfig::load_from(&path).is_err());
    }
}
