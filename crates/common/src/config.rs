// Connection descriptor for SSH Relay
// Loaded from connection.toml, then overridden by the SSH_* environment variables

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Directory name under the platform config dir
pub const APP_DIR: &str = "ssh-relay";

/// How unknown server host keys are treated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Reject hosts not present in known_hosts
    Strict,
    /// Trust on first use and record the key
    #[default]
    AcceptNew,
    /// Accept unknown hosts with a warning, without recording them
    Warn,
}

/// Everything needed to open the shared SSH transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// SSH server hostname or IP
    #[serde(default)]
    pub host: String,
    /// SSH server port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH username
    #[serde(default)]
    pub user: String,
    /// Path to SSH private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    /// Local host reverse tunnels deliver connections to (default: localhost)
    #[serde(default = "default_forward_host")]
    pub forward_host: String,
    /// Address the remote side binds reverse ports on ("" = all interfaces)
    #[serde(default)]
    pub remote_bind_address: String,
    /// Transport keepalive interval in seconds (0 = disabled)
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u64,
    /// TCP connect + handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Path to the known_hosts file used for host key verification
    #[serde(default = "default_known_hosts_path")]
    pub known_hosts_path: PathBuf,
    /// Policy for hosts missing from known_hosts
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_forward_host() -> String {
    "localhost".to_string()
}

fn default_keepalive() -> u64 {
    600
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_known_hosts_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("known_hosts")
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ssh_port(),
            user: String::new(),
            key_path: None,
            forward_host: default_forward_host(),
            remote_bind_address: String::new(),
            keepalive_interval: default_keepalive(),
            connect_timeout: default_connect_timeout(),
            known_hosts_path: default_known_hosts_path(),
            host_key_policy: HostKeyPolicy::default(),
        }
    }
}

/// Get the application config directory (~/.config/ssh-relay)
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
    Ok(config_dir.join(APP_DIR))
}

impl ConnectionConfig {
    /// Load the descriptor from the default location and apply environment overrides
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load the descriptor from a file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No connection file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        info!("Loaded connection settings from: {}", path.display());
        Ok(config)
    }

    /// Apply SSH_HOST, SSH_PORT, SSH_USER, PRIVATE_KEY_PATH and FORWARD_HOST
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("SSH_HOST").filter(|v| !v.is_empty()) {
            self.host = host;
        }
        if let Some(port) = lookup("SSH_PORT").filter(|v| !v.is_empty()) {
            self.port = port
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("Invalid SSH_PORT '{}': {}", port, e)))?;
        }
        if let Some(user) = lookup("SSH_USER").filter(|v| !v.is_empty()) {
            self.user = user;
        }
        if let Some(key) = lookup("PRIVATE_KEY_PATH").filter(|v| !v.is_empty()) {
            self.key_path = Some(PathBuf::from(key));
        }
        if let Some(forward_host) = lookup("FORWARD_HOST").filter(|v| !v.is_empty()) {
            self.forward_host = forward_host;
        }
        Ok(())
    }

    /// Validate the descriptor
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config(
                "SSH host is not set (connection.toml or SSH_HOST)".to_string(),
            ));
        }
        if self.user.is_empty() {
            return Err(Error::Config(
                "SSH user is not set (connection.toml or SSH_USER)".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(Error::Config("Port must be greater than 0".to_string()));
        }
        if self.key_path.is_none() {
            return Err(Error::Config(
                "Private key path is not set (connection.toml or PRIVATE_KEY_PATH)".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the path to the connection file
    pub fn config_path() -> Result<PathBuf> {
        Ok(config_dir()?.join("connection.toml"))
    }

    /// "user@host:port" for log lines
    pub fn display_target(&self) -> String {
        format!(
            "{}@{}",
            self.user,
            crate::network::format_host_port(&self.host, self.port)
        )
    }
}
