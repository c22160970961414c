// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Relay Contributors

//! Zombie binding detection and cleanup on the remote host.
//!
//! `check` classifies a remote bind port with a LISTEN-state query: a LISTEN
//! entry means healthy, a successful query without one means zombie, and a
//! failed query means error. The classifier cannot tell a working listener
//! from one that accepts but never serves; it reports only what the socket
//! table shows. Every call is a fresh remote round-trip.
//!
//! `kill` looks up the owning processes, sends SIGKILL to each, waits, and
//! re-checks. It is idempotent: a port with no owner yields `NoProcess`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use ssh_relay_common::{PortHealth, PortStatus};

use crate::diagnostics::{ExecOutput, RemoteExec, SocketProbe, LISTEN_PROBES, OWNER_PROBES};
use crate::error::{Result, TunnelError};

/// Wait between the kill signals and the verification check
pub const KILL_SETTLE: Duration = Duration::from_secs(1);

/// Result of a `kill` attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    /// Nothing holds the port; safe to call speculatively
    NoProcess,
    /// Signals sent and the port no longer listens
    Killed { pids: Vec<u32> },
    /// Signals sent but the port still listens
    StillListening { pids: Vec<u32> },
    /// Signals sent but the verification query failed
    VerifyFailed { pids: Vec<u32>, reason: String },
}

impl KillOutcome {
    /// True only when the port was held and is now free
    pub fn succeeded(&self) -> bool {
        matches!(self, KillOutcome::Killed { .. })
    }

    /// `NoProcess` is not a failure, just nothing to do
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            KillOutcome::StillListening { .. } | KillOutcome::VerifyFailed { .. }
        )
    }
}

impl std::fmt::Display for KillOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillOutcome::NoProcess => write!(f, "no process found"),
            KillOutcome::Killed { pids } => write!(f, "killed {}", join_pids(pids)),
            KillOutcome::StillListening { pids } => {
                write!(f, "still listening after killing {}", join_pids(pids))
            }
            KillOutcome::VerifyFailed { pids, reason } => {
                write!(f, "killed {} but could not verify: {}", join_pids(pids), reason)
            }
        }
    }
}

fn join_pids(pids: &[u32]) -> String {
    let pids: Vec<String> = pids.iter().map(|p| p.to_string()).collect();
    format!("pid {}", pids.join(", "))
}

/// Per-port binding state as seen by the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindingState {
    #[default]
    Unknown,
    Healthy,
    Zombie,
    Error,
}

impl BindingState {
    pub fn after_check(status: PortStatus) -> Self {
        match status {
            PortStatus::Healthy => BindingState::Healthy,
            PortStatus::Zombie => BindingState::Zombie,
            PortStatus::Error => BindingState::Error,
        }
    }

    /// A successful or no-op kill frees a zombie port; a failed kill leaves it stuck.
    /// Healthy and error states are never changed by a kill.
    pub fn after_kill(self, outcome: &KillOutcome) -> Self {
        match (self, outcome) {
            (BindingState::Zombie, KillOutcome::Killed { .. } | KillOutcome::NoProcess) => {
                BindingState::Unknown
            }
            (BindingState::Zombie, _) => BindingState::Zombie,
            (state, _) => state,
        }
    }
}

/// Outcome of a consult-before-start check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preflight {
    pub health: PortHealth,
    /// Present only when the port was classified as zombie
    pub kill: Option<std::result::Result<KillOutcome, String>>,
    pub state: BindingState,
}

impl Preflight {
    pub fn port(&self) -> u16 {
        self.health.port
    }

    /// The check or the cleanup failed, so the bind may not succeed
    pub fn needs_attention(&self) -> bool {
        match (&self.health.status, &self.kill) {
            (PortStatus::Error, _) => true,
            (_, Some(Ok(outcome))) => outcome.is_failure(),
            (_, Some(Err(_))) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Preflight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port {}: ", self.port())?;
        match (self.health.status, &self.kill) {
            (PortStatus::Healthy, _) => write!(f, "already listening, left in place"),
            (PortStatus::Error, _) => write!(f, "check failed, state unknown"),
            (PortStatus::Zombie, Some(Ok(outcome))) => write!(f, "{}", outcome),
            (PortStatus::Zombie, Some(Err(e))) => write!(f, "cleanup failed: {}", e),
            (PortStatus::Zombie, None) => write!(f, "free"),
        }
    }
}

pub struct ZombieDetector<E: RemoteExec> {
    exec: Arc<E>,
    listen_probes: Vec<SocketProbe>,
    owner_probes: Vec<SocketProbe>,
    settle: Duration,
}

impl<E: RemoteExec> ZombieDetector<E> {
    pub fn new(exec: Arc<E>) -> Self {
        Self {
            exec,
            listen_probes: LISTEN_PROBES.to_vec(),
            owner_probes: OWNER_PROBES.to_vec(),
            settle: KILL_SETTLE,
        }
    }

    pub fn with_listen_probes(mut self, probes: Vec<SocketProbe>) -> Self {
        self.listen_probes = probes;
        self
    }

    pub fn with_owner_probes(mut self, probes: Vec<SocketProbe>) -> Self {
        self.owner_probes = probes;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Classify a remote bind port
    pub async fn check(&self, port: u16) -> PortHealth {
        let status = match self.is_listening(port).await {
            Ok(true) => PortStatus::Healthy,
            Ok(false) => PortStatus::Zombie,
            Err(e) => {
                warn!("Health query for port {} failed: {}", port, e);
                PortStatus::Error
            }
        };
        debug!("Port {} classified as {}", port, status);
        PortHealth::new(port, status)
    }

    /// Terminate whatever holds `port` on the remote host, then verify
    pub async fn kill(&self, port: u16) -> Result<KillOutcome> {
        let pids = self.owner_pids(port).await?;
        if pids.is_empty() {
            info!("No process found holding port {}", port);
            return Ok(KillOutcome::NoProcess);
        }

        for pid in &pids {
            info!("Killing pid {} holding port {}", pid, port);
            let output = self.exec.exec(&format!("kill -9 {}", pid)).await?;
            if !output.stderr.trim().is_empty() {
                warn!("Killing pid {}: {}", pid, output.stderr.trim());
            }
        }

        tokio::time::sleep(self.settle).await;

        let outcome = match self.is_listening(port).await {
            Ok(false) => KillOutcome::Killed { pids },
            Ok(true) => KillOutcome::StillListening { pids },
            Err(e) => KillOutcome::VerifyFailed {
                pids,
                reason: e.to_string(),
            },
        };

        if outcome.is_failure() {
            warn!("Port {}: {}", port, outcome);
        } else {
            info!("Port {}: {}", port, outcome);
        }
        Ok(outcome)
    }

    /// Check, then clean up a zombie classification. Healthy ports are left alone.
    pub async fn preflight(&self, port: u16) -> Preflight {
        let health = self.check(port).await;
        let state = BindingState::after_check(health.status);

        match health.status {
            PortStatus::Zombie => {
                let kill = self.kill(port).await;
                let state = match &kill {
                    Ok(outcome) => state.after_kill(outcome),
                    Err(_) => state,
                };
                Preflight {
                    health,
                    kill: Some(kill.map_err(|e| e.to_string())),
                    state,
                }
            }
            PortStatus::Healthy => {
                info!("Port {} already has a listener; leaving it in place", port);
                Preflight {
                    health,
                    kill: None,
                    state,
                }
            }
            PortStatus::Error => Preflight {
                health,
                kill: None,
                state,
            },
        }
    }

    async fn is_listening(&self, port: u16) -> Result<bool> {
        for probe in &self.listen_probes {
            let command = probe.listen_command(port);
            let Some(output) = self.run_probe(*probe, &command).await? else {
                continue;
            };
            return Ok(probe.parse_listening(&output.stdout, port));
        }
        Err(TunnelError::Exec(format!(
            "no socket listing tool available ({})",
            probe_names(&self.listen_probes)
        )))
    }

    async fn owner_pids(&self, port: u16) -> Result<Vec<u32>> {
        for probe in &self.owner_probes {
            let command = probe.owner_command(port);
            let Some(output) = self.run_probe(*probe, &command).await? else {
                continue;
            };
            let pids = probe.parse_owner_pids(&output.stdout, port);
            // An empty lsof answer is final; netstat/ss may hide owners from
            // unprivileged users, so only trust them when they found something
            if !pids.is_empty() || *probe == SocketProbe::Lsof {
                return Ok(pids);
            }
        }
        Ok(Vec::new())
    }

    /// Run one probe command; `None` when the tool is not installed
    async fn run_probe(&self, probe: SocketProbe, command: &str) -> Result<Option<ExecOutput>> {
        let output = self.exec.exec(command).await?;
        if output.tool_missing() {
            debug!("{} is not available on the remote host, trying next probe", probe);
            return Ok(None);
        }
        Ok(Some(output))
    }
}

fn probe_names(probes: &[SocketProbe]) -> String {
    probes
        .iter()
        .map(|p| p.name())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const LISTENING_5000: &str = "\
Proto Recv-Q Send-Q Local Address           Foreign Address         State
tcp        0      0 0.0.0.0:5000            0.0.0.0:*               LISTEN
";
    const NOTHING: &str = "\
Proto Recv-Q Send-Q Local Address           Foreign Address         State
tcp        0      0 0.0.0.0:22              0.0.0.0:*               LISTEN
";

    /// Scripted remote host. Responses are matched by command prefix; the
    /// listen responses are consumed in order so a kill can change the answer.
    #[derive(Default)]
    struct FakeHost {
        listen: Mutex<Vec<ExecOutput>>,
        owners: Mutex<Vec<(String, ExecOutput)>>,
        fail_all: bool,
        commands: Mutex<Vec<String>>,
    }

    impl FakeHost {
        fn listening(mut self, answers: &[&str]) -> Self {
            self.listen = Mutex::new(answers.iter().map(|s| ok(s)).collect());
            self
        }

        fn owner(self, prefix: &str, output: ExecOutput) -> Self {
            self.owners.lock().unwrap().push((prefix.to_string(), output));
            self
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    fn ok(stdout: &str) -> ExecOutput {
        ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_status: Some(0),
        }
    }

    /// `lsof -nP -iTCP:N` rows for sockets bound locally on `port`
    fn lsof_listing(port: u16, rows: &[(u32, &str)]) -> ExecOutput {
        let mut out = String::from("COMMAND  PID   USER FD TYPE DEVICE SIZE/OFF NODE NAME\n");
        for (pid, state) in rows {
            let name = if *state == "LISTEN" {
                format!("*:{}", port)
            } else {
                format!("10.0.0.5:{}->10.0.0.9:41234", port)
            };
            out.push_str(&format!(
                "sshd {} deploy 9u IPv4 31337 0t0 TCP {} ({})\n",
                pid, name, state
            ));
        }
        ok(&out)
    }

    fn missing(tool: &str) -> ExecOutput {
        ExecOutput {
            stdout: String::new(),
            stderr: format!("bash: {}: command not found", tool),
            exit_status: Some(127),
        }
    }

    #[async_trait]
    impl RemoteExec for FakeHost {
        async fn exec(&self, command: &str) -> Result<ExecOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            if self.fail_all {
                return Err(TunnelError::TransportClosed);
            }
            if command.starts_with("kill -9") {
                return Ok(ok(""));
            }
            if let Some((_, output)) = self
                .owners
                .lock()
                .unwrap()
                .iter()
                .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            {
                return Ok(output.clone());
            }
            let mut listen = self.listen.lock().unwrap();
            if listen.len() > 1 {
                Ok(listen.remove(0))
            } else {
                Ok(listen.first().cloned().unwrap_or_else(|| ok("")))
            }
        }
    }

    fn detector(host: FakeHost) -> (Arc<FakeHost>, ZombieDetector<FakeHost>) {
        let host = Arc::new(host);
        (host.clone(), ZombieDetector::new(host))
    }

    #[tokio::test]
    async fn test_check_healthy_when_listen_line_present() {
        let (_, detector) = detector(FakeHost::default().listening(&[LISTENING_5000]));
        let health = detector.check(5000).await;
        assert_eq!(health, PortHealth::new(5000, PortStatus::Healthy));
        assert!(health.healthy);
    }

    #[tokio::test]
    async fn test_check_zombie_when_no_listener() {
        let (_, detector) = detector(FakeHost::default().listening(&[NOTHING]));
        let health = detector.check(9999).await;
        assert_eq!(health.port, 9999);
        assert_eq!(health.status, PortStatus::Zombie);
        assert!(!health.healthy);
    }

    #[tokio::test]
    async fn test_check_error_when_query_fails() {
        let host = FakeHost {
            fail_all: true,
            ..Default::default()
        };
        let (_, detector) = detector(host);
        let health = detector.check(5000).await;
        assert_eq!(health.status, PortStatus::Error);
        assert!(!health.healthy);
    }

    #[tokio::test]
    async fn test_check_falls_back_when_netstat_missing() {
        let host = FakeHost::default()
            .owner("netstat", missing("netstat"))
            .owner(
                "ss -tln",
                ok("State Recv-Q Send-Q Local Peer\nLISTEN 0 128 0.0.0.0:5000 0.0.0.0:*\n"),
            );
        let (host, detector) = detector(host);
        assert_eq!(detector.check(5000).await.status, PortStatus::Healthy);
        assert_eq!(host.commands(), vec!["netstat -tuln", "ss -tln"]);
    }

    #[tokio::test]
    async fn test_check_error_when_no_tool_available() {
        let host = FakeHost::default()
            .owner("netstat", missing("netstat"))
            .owner("ss", missing("ss"));
        let (_, detector) = detector(host);
        assert_eq!(detector.check(5000).await.status, PortStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_on_free_port_is_no_process() {
        let host = FakeHost::default()
            .listening(&[NOTHING])
            .owner("lsof", ExecOutput { exit_status: Some(1), ..Default::default() });
        let (host, detector) = detector(host);

        let outcome = detector.kill(9999).await.unwrap();
        assert_eq!(outcome, KillOutcome::NoProcess);
        assert!(!outcome.succeeded());
        assert!(!outcome.is_failure());
        assert!(!host.commands().iter().any(|c| c.starts_with("kill")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_frees_port() {
        let host = FakeHost::default()
            .listening(&[NOTHING])
            .owner("lsof", lsof_listing(5000, &[(4242, "CLOSE_WAIT"), (4243, "FIN_WAIT2")]));
        let (host, detector) = detector(host);

        let outcome = detector.kill(5000).await.unwrap();
        assert_eq!(outcome, KillOutcome::Killed { pids: vec![4242, 4243] });
        assert!(outcome.succeeded());

        let commands = host.commands();
        assert!(commands.contains(&"kill -9 4242".to_string()));
        assert!(commands.contains(&"kill -9 4243".to_string()));
        // Verification runs after the kills
        assert_eq!(commands.last().map(String::as_str), Some("netstat -tuln"));

        assert_ne!(detector.check(5000).await.status, PortStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_reports_port_still_listening() {
        let host = FakeHost::default()
            .listening(&[LISTENING_5000])
            .owner("lsof", lsof_listing(5000, &[(4242, "LISTEN")]));
        let (_, detector) = detector(host);

        let outcome = detector.kill(5000).await.unwrap();
        assert_eq!(outcome, KillOutcome::StillListening { pids: vec![4242] });
        assert!(outcome.is_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_uses_netstat_when_lsof_missing() {
        let host = FakeHost::default()
            .owner("lsof", missing("lsof"))
            .owner(
                "netstat -tunap",
                ok("tcp 1 0 10.0.0.5:5000 10.0.0.9:41234 CLOSE_WAIT 777/sshd: deploy\n"),
            )
            .listening(&[NOTHING]);
        let (_, detector) = detector(host);

        let outcome = detector.kill(5000).await.unwrap();
        assert_eq!(outcome, KillOutcome::Killed { pids: vec![777] });
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_waits_before_verifying() {
        let host = FakeHost::default()
            .listening(&[NOTHING])
            .owner("lsof", lsof_listing(5000, &[(4242, "CLOSE_WAIT")]));
        let (_, detector) = detector(host);

        let start = tokio::time::Instant::now();
        detector.kill(5000).await.unwrap();
        assert!(start.elapsed() >= KILL_SETTLE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preflight_never_kills_healthy_port() {
        let host = FakeHost::default()
            .listening(&[LISTENING_5000])
            .owner("lsof", lsof_listing(5000, &[(4242, "LISTEN")]));
        let (host, detector) = detector(host);

        let report = detector.preflight(5000).await;
        assert_eq!(report.state, BindingState::Healthy);
        assert!(report.kill.is_none());
        assert!(!host.commands().iter().any(|c| c.starts_with("lsof") || c.starts_with("kill")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_preflight_cleans_zombie() {
        let host = FakeHost::default()
            .listening(&[NOTHING])
            .owner("lsof", ExecOutput { exit_status: Some(1), ..Default::default() });
        let (_, detector) = detector(host);

        let report = detector.preflight(5000).await;
        assert_eq!(report.health.status, PortStatus::Zombie);
        assert_eq!(report.kill, Some(Ok(KillOutcome::NoProcess)));
        assert_eq!(report.state, BindingState::Unknown);
        assert_eq!(report.port(), 5000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preflight_kills_holder_of_non_listening_socket() {
        // sshd died mid-session and left the bind port in CLOSE_WAIT
        let host = FakeHost::default()
            .listening(&[NOTHING])
            .owner("lsof", lsof_listing(5000, &[(4242, "CLOSE_WAIT")]));
        let (host, detector) = detector(host);

        let report = detector.preflight(5000).await;
        assert_eq!(report.health.status, PortStatus::Zombie);
        assert_eq!(report.kill, Some(Ok(KillOutcome::Killed { pids: vec![4242] })));
        assert_eq!(report.state, BindingState::Unknown);
        assert!(host.commands().contains(&"lsof -nP -iTCP:5000".to_string()));
        assert!(host.commands().contains(&"kill -9 4242".to_string()));
    }

    #[test]
    fn test_preflight_display() {
        let report = |status, kill| Preflight {
            health: PortHealth::new(5000, status),
            kill,
            state: BindingState::Unknown,
        };

        let healthy = report(PortStatus::Healthy, None);
        assert_eq!(healthy.to_string(), "port 5000: already listening, left in place");
        assert!(!healthy.needs_attention());

        let freed = report(
            PortStatus::Zombie,
            Some(Ok(KillOutcome::Killed { pids: vec![42] })),
        );
        assert_eq!(freed.to_string(), "port 5000: killed pid 42");
        assert!(!freed.needs_attention());

        let stuck = report(
            PortStatus::Zombie,
            Some(Ok(KillOutcome::StillListening { pids: vec![42] })),
        );
        assert!(stuck.needs_attention());

        let failed = report(PortStatus::Zombie, Some(Err("transport closed".to_string())));
        assert_eq!(failed.to_string(), "port 5000: cleanup failed: transport closed");
        assert!(failed.needs_attention());

        let unknown = report(PortStatus::Error, None);
        assert_eq!(unknown.to_string(), "port 5000: check failed, state unknown");
        assert!(unknown.needs_attention());
    }

    #[test]
    fn test_binding_state_transitions() {
        let killed = KillOutcome::Killed { pids: vec![1] };
        let stuck = KillOutcome::StillListening { pids: vec![1] };

        assert_eq!(BindingState::Zombie.after_kill(&killed), BindingState::Unknown);
        assert_eq!(BindingState::Zombie.after_kill(&stuck), BindingState::Zombie);
        assert_eq!(BindingState::Healthy.after_kill(&killed), BindingState::Healthy);
        assert_eq!(BindingState::after_check(PortStatus::Error), BindingState::Error);
        assert_eq!(BindingState::default(), BindingState::Unknown);
    }
}
