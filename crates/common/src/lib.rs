// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Relay Contributors

// SSH Relay - Common Library
// Shared types, connection settings and the mapping repository

pub mod config;
pub mod error;
pub mod mapping;
pub mod mapping_store;
pub mod network;
pub mod types;

pub use config::{config_dir, ConnectionConfig, HostKeyPolicy, APP_DIR};
pub use error::{Error, Result};
pub use mapping::{ensure_unique_bind_ports, parse_specs, plan_reverse, MappingSpec, ReverseMapping};
pub use mapping_store::{MappingRepository, MappingStore};
pub use network::{format_host_port, is_loopback_address};
pub use types::{PortHealth, PortStatus, TunnelMapping};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
