// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Relay Contributors

// Error types shared by the relay crates

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Mapping not found: {0}")]
    MappingNotFound(String),

    #[error("Mapping already exists: {0}")]
    MappingExists(String),

    #[error("Invalid mapping: {0}")]
    InvalidMapping(String),

    #[error("Bind port {port} is used by both '{first}' and '{second}'")]
    DuplicateBindPort {
        port: u16,
        first: String,
        second: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
