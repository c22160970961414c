// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Relay Contributors

// Reverse mapping parsing and validation.
// Every input shape is normalized here, once, before orchestration.

use std::collections::HashMap;
use std::str::FromStr;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::TunnelMapping;

/// A validated reverse tunnel request: expose `local_port` on the remote `bind_port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseMapping {
    pub name: String,
    pub local_port: u16,
    pub bind_port: u16,
}

impl ReverseMapping {
    pub fn new(name: impl Into<String>, local_port: u16, bind_port: u16) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidMapping("Name cannot be empty".to_string()));
        }
        if local_port == 0 || bind_port == 0 {
            return Err(Error::InvalidMapping(format!(
                "{}: ports must be greater than 0 (local {}, bind {})",
                name, local_port, bind_port
            )));
        }
        Ok(Self {
            name,
            local_port,
            bind_port,
        })
    }
}

impl std::fmt::Display for ReverseMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (local {} -> bind {})", self.name, self.local_port, self.bind_port)
    }
}

/// Parses `LOCAL:BIND` or `NAME=LOCAL:BIND`
impl FromStr for ReverseMapping {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (name, ports) = match s.split_once('=') {
            Some((name, ports)) => (Some(name.trim()), ports.trim()),
            None => (None, s),
        };

        let (local, bind) = ports.split_once(':').ok_or_else(|| {
            Error::InvalidMapping(format!("'{}': expected LOCAL:BIND or NAME=LOCAL:BIND", s))
        })?;

        let local_port = parse_port(local, s)?;
        let bind_port = parse_port(bind, s)?;
        let name = match name {
            Some(n) => n.to_string(),
            None => format!("{}:{}", local_port, bind_port),
        };

        ReverseMapping::new(name, local_port, bind_port)
    }
}

fn parse_port(value: &str, input: &str) -> Result<u16> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|e| Error::InvalidMapping(format!("'{}': invalid port '{}': {}", input, value, e)))
}

/// Accepted input shapes for a reverse mapping in configuration documents
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MappingSpec {
    /// "5000:5000" or "web=5000:5000"
    Text(String),
    /// [5000, 5000]
    Pair(u32, u32),
    /// { name = "web", local = 5000, bind = 5000 }
    Record {
        #[serde(default)]
        name: Option<String>,
        #[serde(alias = "local")]
        local_port: u32,
        #[serde(alias = "bind")]
        bind_port: u32,
    },
}

impl MappingSpec {
    /// Normalize into a validated `ReverseMapping`. `index` is used in error messages.
    pub fn into_reverse(self, index: usize) -> Result<ReverseMapping> {
        match self {
            MappingSpec::Text(text) => text
                .parse::<ReverseMapping>()
                .map_err(|e| Error::InvalidMapping(format!("entry {}: {}", index, e))),
            MappingSpec::Pair(local, bind) => {
                let (local, bind) = narrow_ports(local, bind, index)?;
                ReverseMapping::new(format!("{}:{}", local, bind), local, bind)
            }
            MappingSpec::Record {
                name,
                local_port,
                bind_port,
            } => {
                let (local, bind) = narrow_ports(local_port, bind_port, index)?;
                let name = name.unwrap_or_else(|| format!("{}:{}", local, bind));
                ReverseMapping::new(name, local, bind)
            }
        }
    }
}

fn narrow_ports(local: u32, bind: u32, index: usize) -> Result<(u16, u16)> {
    let narrow = |p: u32| {
        u16::try_from(p).map_err(|_| {
            Error::InvalidMapping(format!("entry {}: port {} is out of range", index, p))
        })
    };
    Ok((narrow(local)?, narrow(bind)?))
}

/// Parse a list of mapping specs, rejecting the whole list on the first malformed entry
pub fn parse_specs(specs: Vec<MappingSpec>) -> Result<Vec<ReverseMapping>> {
    let mappings = specs
        .into_iter()
        .enumerate()
        .map(|(idx, spec)| spec.into_reverse(idx + 1))
        .collect::<Result<Vec<_>>>()?;
    ensure_unique_bind_ports(&mappings)?;
    Ok(mappings)
}

/// Build the reverse start plan from repository records, preserving list order.
/// Records without a bind port are forward tunnels and are not part of the plan.
pub fn plan_reverse(mappings: &[TunnelMapping]) -> Result<Vec<ReverseMapping>> {
    let mut plan = Vec::with_capacity(mappings.len());

    for mapping in mappings {
        let Some(bind_port) = mapping.server_bind_port else {
            debug!("Skipping forward-only mapping '{}'", mapping.name);
            continue;
        };
        mapping.validate()?;
        plan.push(ReverseMapping::new(
            mapping.name.clone(),
            mapping.local_port,
            bind_port,
        )?);
    }

    ensure_unique_bind_ports(&plan)?;
    Ok(plan)
}

/// Two reverse binds on the same port from one session conflict
pub fn ensure_unique_bind_ports(mappings: &[ReverseMapping]) -> Result<()> {
    let mut seen: HashMap<u16, &str> = HashMap::new();
    for mapping in mappings {
        if let Some(first) = seen.insert(mapping.bind_port, &mapping.name) {
            return Err(Error::DuplicateBindPort {
                port: mapping.bind_port,
                first: first.to_string(),
                second: mapping.name.clone(),
            });
        }
    }
    Ok(())
}
