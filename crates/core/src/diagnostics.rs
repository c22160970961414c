// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Relay Contributors

//! Remote diagnostics: one-shot command execution over the transport and the
//! socket-probe strategies used to query listening ports and their owners.
//!
//! Tool availability differs between remote hosts, so every query is expressed
//! per probe (`netstat`, `ss`, `lsof`) and callers walk an ordered list,
//! falling through to the next probe when the shell reports the tool missing.

use async_trait::async_trait;

use crate::error::Result;

/// Captured result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// None when the remote side closed the channel without reporting a status
    pub exit_status: Option<u32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// The remote shell could not run the tool at all
    pub fn tool_missing(&self) -> bool {
        if self.exit_status == Some(127) {
            return true;
        }
        let stderr = self.stderr.to_lowercase();
        stderr.contains("command not found") || stderr.contains(": not found")
    }
}

/// One-shot remote command execution
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn exec(&self, command: &str) -> Result<ExecOutput>;
}

#[async_trait]
impl<T: RemoteExec + ?Sized> RemoteExec for std::sync::Arc<T> {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        (**self).exec(command).await
    }
}

/// A remote tool able to enumerate sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketProbe {
    Netstat,
    Ss,
    Lsof,
}

/// Probes tried, in order, to decide whether a port is listening
pub const LISTEN_PROBES: &[SocketProbe] = &[SocketProbe::Netstat, SocketProbe::Ss];

/// Probes tried, in order, to find the processes holding a port
pub const OWNER_PROBES: &[SocketProbe] = &[SocketProbe::Lsof, SocketProbe::Netstat, SocketProbe::Ss];

impl SocketProbe {
    pub fn name(&self) -> &'static str {
        match self {
            SocketProbe::Netstat => "netstat",
            SocketProbe::Ss => "ss",
            SocketProbe::Lsof => "lsof",
        }
    }

    pub fn listen_command(&self, port: u16) -> String {
        match self {
            SocketProbe::Netstat => "netstat -tuln".to_string(),
            SocketProbe::Ss => "ss -tln".to_string(),
            SocketProbe::Lsof => format!("lsof -nP -iTCP:{} -sTCP:LISTEN", port),
        }
    }

    /// Lists every socket on the port whatever its state, with owning processes
    pub fn owner_command(&self, port: u16) -> String {
        match self {
            SocketProbe::Netstat => "netstat -tunap".to_string(),
            SocketProbe::Ss => "ss -tanp".to_string(),
            SocketProbe::Lsof => format!("lsof -nP -iTCP:{}", port),
        }
    }

    /// True when the output holds a LISTEN entry whose local address is on `port`
    pub fn parse_listening(&self, output: &str, port: u16) -> bool {
        output
            .lines()
            .any(|line| self.listening_fields(line, port).is_some())
    }

    /// Process ids holding any socket bound locally on `port`, sorted and
    /// deduplicated. Sockets left in CLOSE_WAIT or FIN_WAIT count as held.
    pub fn parse_owner_pids(&self, output: &str, port: u16) -> Vec<u32> {
        let rows = output.lines().filter_map(|line| self.holding_fields(line, port));
        let mut pids: Vec<u32> = match self {
            // COMMAND PID USER ...
            SocketProbe::Lsof => rows
                .filter_map(|fields| fields.get(1).and_then(|pid| pid.parse().ok()))
                .collect(),
            // PID/Program name column, "-" when the owner is not visible. UDP
            // rows have no state, so the column is found rather than indexed.
            SocketProbe::Netstat => rows
                .filter_map(|fields| {
                    fields
                        .iter()
                        .skip(5)
                        .find(|f| f.contains('/') || **f == "-")
                        .copied()
                })
                .filter_map(|owner| owner.split('/').next())
                .filter_map(|pid| pid.parse().ok())
                .collect(),
            SocketProbe::Ss => rows
                .flat_map(|fields| {
                    fields
                        .iter()
                        .skip(5)
                        .flat_map(|f| ss_pids(f))
                        .collect::<Vec<_>>()
                })
                .collect(),
        };
        pids.sort_unstable();
        pids.dedup();
        pids
    }

    fn listening_fields<'a>(&self, line: &'a str, port: u16) -> Option<Vec<&'a str>> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let state = match self {
            // Proto Recv-Q Send-Q Local Foreign State [PID/Program]
            SocketProbe::Netstat => fields.get(5)?,
            // State Recv-Q Send-Q Local Peer [Process]
            SocketProbe::Ss => fields.first()?,
            // COMMAND PID USER FD TYPE DEVICE SIZE/OFF NODE NAME (LISTEN)
            SocketProbe::Lsof => fields.last()?,
        };
        let listening = *state == "LISTEN" || *state == "(LISTEN)";
        if listening && on_port(self.local_address(&fields)?, port) {
            Some(fields)
        } else {
            None
        }
    }

    fn holding_fields<'a>(&self, line: &'a str, port: u16) -> Option<Vec<&'a str>> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if on_port(self.local_address(&fields)?, port) {
            Some(fields)
        } else {
            None
        }
    }

    fn local_address<'a>(&self, fields: &[&'a str]) -> Option<&'a str> {
        match self {
            SocketProbe::Netstat | SocketProbe::Ss => fields.get(3).copied(),
            SocketProbe::Lsof => {
                // NAME is `local->peer`, followed by `(STATE)` for TCP
                let last = fields.last()?;
                let name = if last.starts_with('(') {
                    fields.get(fields.len().checked_sub(2)?)?
                } else {
                    last
                };
                name.split("->").next()
            }
        }
    }
}

impl std::fmt::Display for SocketProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn on_port(local: &str, port: u16) -> bool {
    local
        .rsplit_once(':')
        .map(|(_, p)| p == port.to_string())
        .unwrap_or(false)
}

/// Extract every `pid=N` from an ss process column such as
/// `users:(("sshd",pid=812,fd=9),("sshd",pid=813,fd=9))`
fn ss_pids(field: &str) -> Vec<u32> {
    field
        .split("pid=")
        .skip(1)
        .filter_map(|rest| {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        })
        .collect()
}
