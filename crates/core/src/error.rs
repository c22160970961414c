// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Relay Contributors

// Error types for the tunnel engine

use std::time::Duration;

use thiserror::Error;

/// Coarse error classes used for logging and exit-code decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport could not be established or was lost
    Connectivity,
    /// Remote bind request was rejected
    Bind,
    /// An operation ran out of time
    Timeout,
    /// A single relayed connection failed
    Relay,
    /// Remote diagnostics command failed
    Diagnostics,
    /// Invalid configuration or mapping
    Config,
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Host key for {0} was rejected")]
    HostKeyRejected(String),

    #[error("Failed to open channel to {target}: {reason}")]
    ChannelOpen { target: String, reason: String },

    #[error("Remote bind on port {port} was rejected: {reason}")]
    BindRejected { port: u16, reason: String },

    #[error("Transport connection is closed")]
    TransportClosed,

    #[error("Remote command failed: {0}")]
    Exec(String),

    #[error("Failed to connect to local service {addr}: {source}")]
    LocalConnect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("Key error: {0}")]
    Key(#[from] russh::keys::Error),

    #[error(transparent)]
    Config(#[from] ssh_relay_common::Error),
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::Connect { .. }
            | TunnelError::Authentication(_)
            | TunnelError::HostKeyRejected(_)
            | TunnelError::TransportClosed
            | TunnelError::Ssh(_)
            | TunnelError::Key(_) => ErrorKind::Connectivity,
            TunnelError::Timeout { .. } => ErrorKind::Timeout,
            TunnelError::BindRejected { .. } => ErrorKind::Bind,
            TunnelError::ChannelOpen { .. }
            | TunnelError::LocalConnect { .. }
            | TunnelError::Io(_) => ErrorKind::Relay,
            TunnelError::Exec(_) => ErrorKind::Diagnostics,
            TunnelError::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn timeout(what: impl Into<String>, after: Duration) -> Self {
        TunnelError::Timeout {
            what: what.into(),
            after,
        }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
