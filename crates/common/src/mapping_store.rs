// SSH Relay - Mapping Store Module
// File-backed repository of named tunnel mappings, shared by the CLI and the runner

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::config_dir;
use crate::error::{Error, Result};
use crate::types::TunnelMapping;

/// Repository of tunnel mapping records. The orchestration path only calls `list`.
pub trait MappingRepository {
    /// All mappings, newest first
    fn list(&self) -> Result<Vec<TunnelMapping>>;

    /// Look up a mapping by name
    fn get(&self, name: &str) -> Result<Option<TunnelMapping>>;

    /// Add a mapping; fails with `MappingExists` on a duplicate name
    fn add(&self, mapping: TunnelMapping) -> Result<()>;

    /// Delete a mapping by name; fails with `MappingNotFound` when absent
    fn delete(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MappingFile {
    #[serde(default, rename = "mapping")]
    mappings: Vec<TunnelMapping>,
}

/// TOML-file implementation of `MappingRepository` (mappings.toml)
#[derive(Debug, Clone)]
pub struct MappingStore {
    path: PathBuf,
}

impl MappingStore {
    /// Store at the default location: ~/.config/ssh-relay/mappings.toml
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Self::default_path()?))
    }

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(config_dir()?.join("mappings.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<MappingFile> {
        if !self.path.exists() {
            debug!("Mapping file does not exist yet: {}", self.path.display());
            return Ok(MappingFile::default());
        }
        let contents = fs::read_to_string(&self.path)?;
        Ok(toml::from_str(&contents)?)
    }

    fn write(&self, file: &MappingFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(file)?;
        fs::write(&self.path, contents)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        debug!(
            "Saved {} mapping(s) to {}",
            file.mappings.len(),
            self.path.display()
        );
        Ok(())
    }
}

impl MappingRepository for MappingStore {
    fn list(&self) -> Result<Vec<TunnelMapping>> {
        let mut mappings = self.read()?.mappings;
        mappings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(mappings)
    }

    fn get(&self, name: &str) -> Result<Option<TunnelMapping>> {
        Ok(self.read()?.mappings.into_iter().find(|m| m.name == name))
    }

    fn add(&self, mapping: TunnelMapping) -> Result<()> {
        mapping.validate()?;

        let mut file = self.read()?;
        if file.mappings.iter().any(|m| m.name == mapping.name) {
            return Err(Error::MappingExists(mapping.name));
        }
        if let Some(bind_port) = mapping.server_bind_port {
            if let Some(other) = file
                .mappings
                .iter()
                .find(|m| m.server_bind_port == Some(bind_port))
            {
                return Err(Error::Config(format!(
                    "Bind port {} is already used by mapping '{}'",
                    bind_port, other.name
                )));
            }
        }

        file.mappings.push(mapping);
        self.write(&file)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut file = self.read()?;
        let before = file.mappings.len();
        file.mappings.retain(|m| m.name != name);
        if file.mappings.len() == before {
            return Err(Error::MappingNotFound(name.to_string()));
        }
        self.write(&file)
    }
}
