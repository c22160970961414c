// Common types for SSH Relay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A named tunnel mapping as stored in the mapping repository
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelMapping {
    /// Unique mapping name (identity)
    pub name: String,
    /// Local port: the service exposed by a reverse tunnel, or the listener of a forward tunnel
    pub local_port: u16,
    /// Remote host: public address for reverse tunnels, destination host for forward tunnels
    pub remote_host: String,
    /// Remote destination port (forward tunnels)
    pub remote_port: u16,
    /// Port the remote endpoint binds for a reverse tunnel (absent for pure forward tunnels)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_bind_port: Option<u16>,
    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Informational marker kept for stored records. Planning and
    /// orchestration start every reverse mapping regardless of it.
    #[serde(default)]
    pub active: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl TunnelMapping {
    /// Create a reverse mapping: expose `local_port` on the remote endpoint's `bind_port`
    pub fn reverse(name: impl Into<String>, local_port: u16, remote_host: impl Into<String>, bind_port: u16) -> Self {
        Self {
            name: name.into(),
            local_port,
            remote_host: remote_host.into(),
            // Reverse records mirror the local port here; only the bind port is used
            remote_port: local_port,
            server_bind_port: Some(bind_port),
            description: None,
            active: false,
            created_at: Utc::now(),
        }
    }

    /// Create a forward mapping: listen on `local_port` and reach `remote_host:remote_port`
    pub fn forward(
        name: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            server_bind_port: None,
            description: None,
            active: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        self.description = if description.trim().is_empty() {
            None
        } else {
            Some(description)
        };
        self
    }

    /// True when this mapping describes a reverse tunnel
    pub fn is_reverse(&self) -> bool {
        self.server_bind_port.is_some()
    }

    /// Validate the mapping record
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidMapping("Name cannot be empty".to_string()));
        }
        if self.local_port == 0 {
            return Err(Error::InvalidMapping(format!(
                "{}: local port must be greater than 0",
                self.name
            )));
        }
        if self.remote_port == 0 {
            return Err(Error::InvalidMapping(format!(
                "{}: remote port must be greater than 0",
                self.name
            )));
        }
        if self.server_bind_port == Some(0) {
            return Err(Error::InvalidMapping(format!(
                "{}: bind port must be greater than 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// Health classification of a remote bind port
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    /// Remote query found the port in LISTEN state
    Healthy,
    /// Remote query succeeded but found no listener
    Zombie,
    /// The remote query itself failed; state unknown
    Error,
}

impl PortStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortStatus::Healthy => "healthy",
            PortStatus::Zombie => "zombie",
            PortStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for PortStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single port health query. Never persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortHealth {
    pub port: u16,
    pub status: PortStatus,
    pub healthy: bool,
}

impl PortHealth {
    pub fn new(port: u16, status: PortStatus) -> Self {
        Self {
            port,
            status,
            healthy: status == PortStatus::Healthy,
        }
    }
}
