// SSH Relay - Known Hosts Module
// Host key verification against a known_hosts file, with a configurable
// policy for hosts seen for the first time

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use ssh_relay_common::HostKeyPolicy;

use crate::error::Result;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyResult {
    /// Host key is in known_hosts and matches
    Trusted,
    /// Host key is not in known_hosts (first connection)
    Unknown,
    /// Host key is in known_hosts but doesn't match
    Mismatch {
        actual_fingerprint: String,
        line_number: usize,
    },
}

#[derive(Debug, Clone)]
struct KnownHostEntry {
    /// "host" or "[host]:port"
    host_pattern: String,
    key_type: String,
    /// Base64-encoded public key blob
    key_data: String,
    comment: Option<String>,
    line_number: usize,
}

impl KnownHostEntry {
    fn parse(line: &str, line_number: usize) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            warn!("Invalid known_hosts entry at line {}: too few fields", line_number);
            return None;
        }

        Some(KnownHostEntry {
            host_pattern: parts[0].to_string(),
            key_type: parts[1].to_string(),
            key_data: parts[2].to_string(),
            comment: parts.get(3).map(|s| s.to_string()),
            line_number,
        })
    }

    fn format(&self) -> String {
        match &self.comment {
            Some(comment) => format!(
                "{} {} {} {}",
                self.host_pattern, self.key_type, self.key_data, comment
            ),
            None => format!("{} {} {}", self.host_pattern, self.key_type, self.key_data),
        }
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        // A comma-separated pattern list covers several names for one key
        self.host_pattern
            .split(',')
            .any(|pattern| pattern == format_host_pattern(host, port) || (port == 22 && pattern == host))
    }

    fn verify_key(&self, key: &PublicKey) -> bool {
        self.key_type == key_type_to_string(key) && self.key_data == key.public_key_base64()
    }
}

/// In-memory view of a known_hosts file
pub struct KnownHosts {
    path: PathBuf,
    entries: Vec<KnownHostEntry>,
}

impl KnownHosts {
    /// Load from a path; a missing file is an empty store
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut entries = Vec::new();

        if path.exists() {
            let reader = BufReader::new(fs::File::open(path)?);
            for (idx, line) in reader.lines().enumerate() {
                if let Some(entry) = KnownHostEntry::parse(&line?, idx + 1) {
                    entries.push(entry);
                }
            }
            debug!("Loaded {} entries from known_hosts: {}", entries.len(), path.display());
        } else {
            debug!("Known_hosts file does not exist yet: {}", path.display());
        }

        Ok(KnownHosts {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> VerifyResult {
        let matching: Vec<&KnownHostEntry> =
            self.entries.iter().filter(|e| e.matches(host, port)).collect();

        let Some(first) = matching.first() else {
            return VerifyResult::Unknown;
        };

        if matching.iter().any(|e| e.verify_key(key)) {
            return VerifyResult::Trusted;
        }

        VerifyResult::Mismatch {
            actual_fingerprint: calculate_fingerprint(key),
            line_number: first.line_number,
        }
    }

    pub fn add(&mut self, host: &str, port: u16, key: &PublicKey) {
        self.entries.push(KnownHostEntry {
            host_pattern: format_host_pattern(host, port),
            key_type: key_type_to_string(key),
            key_data: key.public_key_base64(),
            comment: None,
            line_number: self.entries.len() + 1,
        });
        info!("Added host key for {}:{} to known_hosts", host, port);
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::File::create(&self.path)?;
        writeln!(file, "# SSH Relay - Known Hosts")?;
        writeln!(file)?;
        for entry in &self.entries {
            writeln!(file, "{}", entry.format())?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        debug!("Saved {} entries to known_hosts: {}", self.entries.len(), self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decide whether to accept `key` for `host:port` under `policy`.
    /// Newly accepted keys are persisted when the policy is `AcceptNew`.
    /// A mismatching key is always rejected.
    pub fn check(
        &mut self,
        host: &str,
        port: u16,
        key: &PublicKey,
        policy: HostKeyPolicy,
    ) -> Result<bool> {
        match self.verify(host, port, key) {
            VerifyResult::Trusted => {
                debug!("Host key verified for {}:{}", host, port);
                Ok(true)
            }
            VerifyResult::Unknown => {
                let fingerprint = calculate_fingerprint(key);
                match policy {
                    HostKeyPolicy::Strict => {
                        error!(
                            "Unknown host key for {}:{} ({}); rejected by strict policy",
                            host, port, fingerprint
                        );
                        Ok(false)
                    }
                    HostKeyPolicy::AcceptNew => {
                        info!(
                            "Accepting new host key for {}:{} ({} {})",
                            host,
                            port,
                            key_type_to_string(key),
                            fingerprint
                        );
                        self.add(host, port, key);
                        self.save()?;
                        Ok(true)
                    }
                    HostKeyPolicy::Warn => {
                        warn!(
                            "Host key for {}:{} is not in known_hosts ({}); continuing without saving",
                            host, port, fingerprint
                        );
                        Ok(true)
                    }
                }
            }
            VerifyResult::Mismatch {
                actual_fingerprint,
                line_number,
            } => {
                error!("REMOTE HOST IDENTIFICATION HAS CHANGED for {}:{}", host, port);
                error!("Offered fingerprint: {}", actual_fingerprint);
                error!(
                    "Remove line {} from {} if the change is expected",
                    line_number,
                    self.path.display()
                );
                Ok(false)
            }
        }
    }
}

/// "host" for port 22, "[host]:port" otherwise
fn format_host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Algorithm name from the SSH wire encoding of the key
fn key_type_to_string(key: &PublicKey) -> String {
    let key_bytes = key.public_key_bytes();
    if key_bytes.len() < 4 {
        return "unknown".to_string();
    }
    let len = u32::from_be_bytes([key_bytes[0], key_bytes[1], key_bytes[2], key_bytes[3]]) as usize;
    if key_bytes.len() < 4 + len {
        return "unknown".to_string();
    }
    String::from_utf8_lossy(&key_bytes[4..4 + len]).to_string()
}

/// SHA256 fingerprint in OpenSSH style
pub fn calculate_fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    let digest = hasher.finalize();
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
    )
}
