// SSH Relay - Runner
// One top-level run: pre-flight, connect, zombie pre-check, orchestrate,
// serve until shutdown, tear down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ssh_relay_common::{plan_reverse, ConnectionConfig, MappingRepository, MappingStore, ReverseMapping};
use ssh_relay_core::{
    MappingOutcome, OrchestrationReport, Preflight, ReverseSettings, ReverseStarter, SshTransport,
    TunnelOrchestrator, ZombieDetector,
};

use crate::config::RunnerConfig;
use crate::pidfile::PidFileGuard;

/// How often the runner checks that the shared transport is still up
const TRANSPORT_WATCH: Duration = Duration::from_secs(5);

/// Grace period per tunnel during teardown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Process exit status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Tunnels ran and the run ended on a shutdown signal
    Completed,
    /// Nothing to run, or the pre-flight checks or the connection failed
    Unavailable,
    /// Unexpected failure while orchestrating or serving
    Fatal,
}

impl RunStatus {
    pub fn code(self) -> u8 {
        match self {
            RunStatus::Completed => 0,
            RunStatus::Unavailable => 1,
            RunStatus::Fatal => 2,
        }
    }
}

/// A run that ended early, with the status to exit with
#[derive(Debug)]
pub struct Abort {
    pub status: RunStatus,
    pub error: anyhow::Error,
}

trait AbortWith<T> {
    fn abort_with(self, status: RunStatus) -> Result<T, Abort>;
}

impl<T, E: Into<anyhow::Error>> AbortWith<T> for Result<T, E> {
    fn abort_with(self, status: RunStatus) -> Result<T, Abort> {
        self.map_err(|e| Abort {
            status,
            error: e.into(),
        })
    }
}

/// Run until `shutdown` fires or the transport is lost
pub async fn run(shutdown: &CancellationToken) -> Result<RunStatus, Abort> {
    let _pid_guard = PidFileGuard::create()
        .context("Failed to create PID file - another runner may already be active")
        .abort_with(RunStatus::Unavailable)?;

    let connection = ConnectionConfig::load()
        .context("Failed to load connection settings")
        .abort_with(RunStatus::Unavailable)?;
    let settings = RunnerConfig::load().abort_with(RunStatus::Unavailable)?;
    let store = MappingStore::open_default().abort_with(RunStatus::Unavailable)?;
    let plan = load_plan(&store)?;

    info!(
        "{} reverse mapping(s) planned from {}",
        plan.len(),
        store.path().display()
    );

    let transport = SshTransport::connect(&connection)
        .await
        .with_context(|| format!("Cannot reach {}", connection.display_target()))
        .abort_with(RunStatus::Unavailable)?;
    let transport = Arc::new(transport);
    println!(
        "{} Connected to {}",
        "✓".green(),
        transport.target().bold()
    );

    if settings.preflight_zombie_check {
        run_preflight(&transport, &plan).await;
    }

    let reverse = ReverseSettings::from_connection(&connection).max_connections(settings.max_connections);
    let starter = ReverseStarter::new(transport.clone(), reverse).cancel_with(shutdown);
    let orchestrator = TunnelOrchestrator::new(starter, settings.policy());

    let orchestration = orchestrator
        .run(&plan, shutdown)
        .await
        .context("Orchestration failed")
        .abort_with(RunStatus::Fatal)?;

    print_report(&orchestration.report);

    if orchestration.handles.is_empty() && !shutdown.is_cancelled() {
        disconnect(&transport).await;
        return Err(Abort {
            status: RunStatus::Fatal,
            error: anyhow::anyhow!("No tunnel could be started"),
        });
    }

    println!("{}", "Tunnels running. Press Ctrl+C to stop.".dimmed());

    let lost = tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = wait_for_transport_loss(&transport) => true,
    };

    for handle in orchestration.handles {
        handle.shutdown_timeout(SHUTDOWN_GRACE).await;
    }
    info!("All tunnels stopped");

    if lost {
        error!("Connection to {} was lost", transport.target());
        return Err(Abort {
            status: RunStatus::Fatal,
            error: anyhow::anyhow!("Connection to {} was lost", transport.target()),
        });
    }

    disconnect(&transport).await;
    Ok(RunStatus::Completed)
}

/// Turn stored mappings into the reverse start plan; an empty plan is an error
pub fn load_plan(repository: &impl MappingRepository) -> Result<Vec<ReverseMapping>, Abort> {
    let mappings = repository
        .list()
        .context("Failed to read mappings")
        .abort_with(RunStatus::Unavailable)?;
    let plan = plan_reverse(&mappings)
        .context("Invalid mapping configuration")
        .abort_with(RunStatus::Unavailable)?;

    if plan.is_empty() {
        return Err(Abort {
            status: RunStatus::Unavailable,
            error: anyhow::anyhow!(
                "No reverse mappings configured. Add one with `ssh-relay add`."
            ),
        });
    }
    Ok(plan)
}

async fn run_preflight(transport: &Arc<SshTransport>, plan: &[ReverseMapping]) {
    let detector = ZombieDetector::new(transport.clone());
    println!("{}", "Checking remote bind ports...".bold());
    for mapping in plan {
        let preflight = detector.preflight(mapping.bind_port).await;
        println!("  {}", render_preflight(&mapping.name, &preflight));
    }
}

async fn wait_for_transport_loss(transport: &SshTransport) {
    let mut ticker = tokio::time::interval(TRANSPORT_WATCH);
    loop {
        ticker.tick().await;
        if transport.is_closed().await {
            return;
        }
    }
}

async fn disconnect(transport: &SshTransport) {
    if let Err(e) = transport.disconnect().await {
        warn!("Disconnect from {} failed: {}", transport.target(), e);
    }
}

fn print_report(report: &OrchestrationReport) {
    println!();
    for outcome in &report.outcomes {
        println!("  {}", render_outcome(outcome));
    }
    let summary = report.summary_line();
    if report.all_succeeded() {
        println!("{}", summary.green().bold());
    } else {
        println!("{} {}", "Warning:".yellow().bold(), summary);
    }
}

fn mark(ok: bool) -> colored::ColoredString {
    if ok {
        "✓".green()
    } else {
        "✗".red()
    }
}

pub fn render_outcome(outcome: &MappingOutcome) -> String {
    format!("{} {}", mark(outcome.succeeded()), outcome)
}

pub fn render_preflight(name: &str, preflight: &Preflight) -> String {
    format!("{} {} {}", mark(!preflight.needs_attention()), name, preflight)
}
