// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Relay Contributors

// SSH Relay - CLI
// Manage tunnel mappings, inspect remote bind ports and run tunnels in the foreground

mod render;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use dialoguer::{Confirm, Input};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ssh_relay_common::{
    parse_specs, plan_reverse, ConnectionConfig, MappingRepository, MappingSpec, MappingStore,
    ReverseMapping, TunnelMapping,
};
use ssh_relay_core::{
    ForwardTunnel, OrchestratorPolicy, ReverseSettings, ReverseStarter, SshTransport,
    TunnelOrchestrator, ZombieDetector,
};

#[derive(Parser)]
#[command(name = "ssh-relay")]
#[command(about = "SSH Relay CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a tunnel mapping
    Add(AddArgs),

    /// List all tunnel mappings
    List {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Show detailed information about a mapping
    Info {
        /// Mapping name
        name: String,
    },

    /// Delete a mapping
    Delete {
        /// Mapping name
        name: String,

        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Check whether a remote bind port has a live listener
    Check {
        /// Remote port
        port: u16,

        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Kill the remote process holding a port
    Kill {
        /// Remote port
        port: u16,

        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Start reverse tunnels in the foreground
    Reverse(ReverseArgs),

    /// Start a forward tunnel in the foreground
    Forward(ForwardArgs),

    /// Test the SSH connection
    Test,
}

#[derive(Args)]
struct AddArgs {
    /// Mapping name
    name: String,

    /// Local port (the exposed service, or the listener for --forward)
    #[arg(short = 'l', long)]
    local_port: Option<u16>,

    /// Port the remote side binds (reverse mappings)
    #[arg(short = 'b', long)]
    bind_port: Option<u16>,

    /// Remote host (public address, or the destination for --forward)
    #[arg(short = 'H', long)]
    remote_host: Option<String>,

    /// Destination port (forward mappings)
    #[arg(short = 'p', long)]
    remote_port: Option<u16>,

    /// Create a forward mapping instead of a reverse one
    #[arg(short = 'f', long)]
    forward: bool,

    #[arg(short = 'd', long)]
    description: Option<String>,

    /// Skip interactive prompts (use provided args only)
    #[arg(short = 'y', long)]
    non_interactive: bool,
}

#[derive(Args)]
struct ReverseArgs {
    /// Mappings as LOCAL:BIND or NAME=LOCAL:BIND; stored mappings when omitted
    mappings: Vec<String>,

    /// Clean up zombie bindings before starting
    #[arg(short, long)]
    clean: bool,

    /// Maximum concurrent connections per tunnel (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    max_connections: usize,
}

#[derive(Args)]
struct ForwardArgs {
    /// Local port to listen on
    #[arg(required_unless_present = "mapping")]
    local_port: Option<u16>,

    /// Destination host, as seen from the SSH server
    #[arg(required_unless_present = "mapping")]
    remote_host: Option<String>,

    /// Destination port
    #[arg(required_unless_present = "mapping")]
    remote_port: Option<u16>,

    /// Use a stored mapping instead of explicit ports
    #[arg(short, long, conflicts_with_all = ["local_port", "remote_host", "remote_port"])]
    mapping: Option<String>,

    /// Local bind address
    #[arg(short = 'b', long, default_value = "127.0.0.1")]
    bind_address: String,

    /// Maximum concurrent connections (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    max_connections: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Add(args) => add_mapping(args)?,
        Commands::List { json } => list_mappings(json)?,
        Commands::Info { name } => show_mapping_info(&name)?,
        Commands::Delete { name, yes } => delete_mapping(&name, yes)?,
        Commands::Check { port, json } => check_port(port, json).await?,
        Commands::Kill { port, yes } => kill_port(port, yes).await?,
        Commands::Reverse(args) => run_reverse(args).await?,
        Commands::Forward(args) => run_forward(args).await?,
        Commands::Test => test_connection().await?,
    }

    Ok(())
}

fn open_store() -> Result<MappingStore> {
    MappingStore::open_default().context("Failed to locate the mapping store")
}

fn load_connection() -> Result<ConnectionConfig> {
    ConnectionConfig::load().with_context(|| {
        let path = ConnectionConfig::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "connection.toml".to_string());
        format!(
            "Failed to load connection settings (edit {} or set SSH_HOST, SSH_USER, PRIVATE_KEY_PATH)",
            path
        )
    })
}

fn spinner(message: String) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

async fn connect(config: &ConnectionConfig) -> Result<Arc<SshTransport>> {
    let progress = spinner(format!("Connecting to {}...", config.display_target()));
    let result = SshTransport::connect(config).await;
    progress.finish_and_clear();

    let transport =
        result.with_context(|| format!("Cannot reach {}", config.display_target()))?;
    println!(
        "{} Connected to {}",
        "✓".green(),
        transport.target().bold()
    );
    Ok(Arc::new(transport))
}

async fn disconnect(transport: &SshTransport) {
    if let Err(e) = transport.disconnect().await {
        tracing::warn!("Disconnect from {} failed: {}", transport.target(), e);
    }
}

/// Ask for a value unless it was given or prompts are disabled
fn value_or_prompt<T>(value: Option<T>, non_interactive: bool, prompt: &str, default: Option<T>) -> Result<T>
where
    T: Clone + ToString + std::str::FromStr,
    <T as std::str::FromStr>::Err: std::fmt::Debug + ToString,
{
    if let Some(value) = value {
        return Ok(value);
    }
    if non_interactive {
        return default
            .ok_or_else(|| anyhow::anyhow!("{} is required in non-interactive mode", prompt));
    }

    let mut input = Input::<T>::new().with_prompt(prompt);
    if let Some(default) = default {
        input = input.default(default);
    }
    Ok(input.interact_text()?)
}

fn add_mapping(args: AddArgs) -> Result<()> {
    let store = open_store()?;
    let interactive = !args.non_interactive;

    println!("{}", "Creating new tunnel mapping".bold().green());
    println!();

    if store.get(&args.name)?.is_some() {
        anyhow::bail!(
            "A mapping with the name '{}' already exists. Delete it first or pick another name.",
            args.name.yellow()
        );
    }

    let local_port: u16 = value_or_prompt(args.local_port, args.non_interactive, "Local port", None)?;

    let mapping = if args.forward {
        let remote_host: String =
            value_or_prompt(args.remote_host, args.non_interactive, "Destination host", None)?;
        let remote_port: u16 =
            value_or_prompt(args.remote_port, args.non_interactive, "Destination port", None)?;
        TunnelMapping::forward(&args.name, local_port, remote_host, remote_port)
    } else {
        // The public address is informational; the runner always binds on the configured server
        let default_host = ConnectionConfig::load_from(&ConnectionConfig::config_path()?)
            .ok()
            .map(|c| c.host)
            .filter(|h| !h.is_empty());
        let remote_host: String =
            value_or_prompt(args.remote_host, args.non_interactive, "Public remote host", default_host)?;
        let bind_port: u16 =
            value_or_prompt(args.bind_port, args.non_interactive, "Remote bind port", Some(local_port))?;
        TunnelMapping::reverse(&args.name, local_port, remote_host, bind_port)
    };

    let description = match args.description {
        Some(description) => description,
        None if interactive => Input::new()
            .with_prompt("Description (optional)")
            .allow_empty(true)
            .interact_text()?,
        None => String::new(),
    };
    let mapping = mapping.with_description(description);

    store.add(mapping.clone()).context("Failed to save mapping")?;

    println!();
    println!("{}", "✓ Mapping created successfully!".green().bold());
    println!("  Saved to: {}", store.path().display().to_string().dimmed());
    println!("  {} ({})", render::route(&mapping), render::direction(&mapping));
    println!();
    if mapping.is_reverse() {
        println!("Start it with: {}", "ssh-relay reverse".yellow());
    } else {
        println!(
            "Start it with: {}",
            format!("ssh-relay forward --mapping {}", mapping.name).yellow()
        );
    }

    Ok(())
}

fn list_mappings(json: bool) -> Result<()> {
    let mappings = open_store()?.list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&mappings)?);
        return Ok(());
    }

    if mappings.is_empty() {
        println!("{}", "No mappings found.".yellow());
        println!("Create one with: {}", "ssh-relay add <name>".cyan());
        return Ok(());
    }

    println!();
    println!("{}", render::mappings_table(&mappings));
    println!();
    println!("{} mapping(s) found", mappings.len().to_string().cyan());
    println!();
    Ok(())
}

fn show_mapping_info(name: &str) -> Result<()> {
    let mapping = open_store()?
        .get(name)?
        .ok_or_else(|| anyhow::anyhow!("Mapping '{}' not found", name))?;

    println!();
    println!("{}", format!("Mapping: {}", mapping.name).bold().green());
    if let Some(desc) = &mapping.description {
        println!("  Description: {}", desc);
    }
    println!("  Direction:   {}", render::direction(&mapping));
    println!("  Route:       {}", render::route(&mapping));
    println!("  Local Port:  {}", mapping.local_port);
    println!("  Remote Host: {}", mapping.remote_host);
    println!("  Remote Port: {}", mapping.remote_port);
    if let Some(bind_port) = mapping.server_bind_port {
        println!("  Bind Port:   {}", bind_port);
    }
    println!(
        "  Created:     {}",
        mapping
            .created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
    Ok(())
}

fn delete_mapping(name: &str, yes: bool) -> Result<()> {
    let store = open_store()?;
    if store.get(name)?.is_none() {
        anyhow::bail!("Mapping '{}' not found", name.yellow());
    }

    if !yes
        && !Confirm::new()
            .with_prompt(format!(
                "Are you sure you want to delete mapping '{}'?",
                name.yellow()
            ))
            .default(false)
            .interact()?
    {
        println!("{}", "Deletion cancelled".dimmed());
        return Ok(());
    }

    store.delete(name)?;
    println!("{}", format!("Mapping '{}' deleted", name).green());
    Ok(())
}

async fn check_port(port: u16, json: bool) -> Result<()> {
    let config = load_connection()?;
    let transport = connect(&config).await?;

    let health = ZombieDetector::new(transport.clone()).check(port).await;
    disconnect(&transport).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&health)?);
    } else {
        println!("{}", render::health_line(&health));
    }
    Ok(())
}

async fn kill_port(port: u16, yes: bool) -> Result<()> {
    if !yes
        && !Confirm::new()
            .with_prompt(format!(
                "Kill every remote process listening on port {}?",
                port
            ))
            .default(false)
            .interact()?
    {
        println!("{}", "Kill cancelled".dimmed());
        return Ok(());
    }

    let config = load_connection()?;
    let transport = connect(&config).await?;

    let progress = spinner(format!("Freeing remote port {}...", port));
    let result = ZombieDetector::new(transport.clone()).kill(port).await;
    progress.finish_and_clear();
    disconnect(&transport).await;

    let outcome = result.with_context(|| format!("Failed to kill the holder of port {}", port))?;
    if outcome.is_failure() {
        anyhow::bail!("Port {}: {}", port, outcome);
    }
    println!("{} Port {}: {}", "✓".green(), port, outcome);
    Ok(())
}

fn reverse_plan(specs: Vec<String>) -> Result<Vec<ReverseMapping>> {
    if specs.is_empty() {
        let mappings = open_store()?.list()?;
        return plan_reverse(&mappings).context("Invalid mapping configuration");
    }
    parse_specs(specs.into_iter().map(MappingSpec::Text).collect()).context("Invalid mapping")
}

async fn run_reverse(args: ReverseArgs) -> Result<()> {
    let plan = reverse_plan(args.mappings)?;
    if plan.is_empty() {
        anyhow::bail!("No reverse mappings to start. Pass LOCAL:BIND or add one with `ssh-relay add`.");
    }

    let config = load_connection()?;
    let transport = connect(&config).await?;

    if args.clean {
        let detector = ZombieDetector::new(transport.clone());
        for mapping in &plan {
            let preflight = detector.preflight(mapping.bind_port).await;
            println!("  {}", render::preflight_line(&mapping.name, &preflight));
        }
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    let settings = ReverseSettings::from_connection(&config).max_connections(args.max_connections);
    let starter = ReverseStarter::new(transport.clone(), settings).cancel_with(&shutdown);
    let orchestration = TunnelOrchestrator::new(starter, OrchestratorPolicy::default())
        .run(&plan, &shutdown)
        .await?;

    println!();
    for outcome in &orchestration.report.outcomes {
        println!("  {}", render::outcome_line(outcome));
    }
    let summary = orchestration.report.summary_line();
    if orchestration.report.all_succeeded() {
        println!("{}", summary.green().bold());
    } else {
        println!("{} {}", "Warning:".yellow().bold(), summary);
    }

    if orchestration.handles.is_empty() {
        disconnect(&transport).await;
        anyhow::bail!("No tunnel could be started");
    }

    println!();
    println!("{}", "Tunnels running. Press Ctrl+C to stop.".dimmed());

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let lost = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break false,
            _ = ticker.tick() => {
                if orchestration.all_finished() {
                    break true;
                }
            }
        }
    };

    orchestration.shutdown().await;
    disconnect(&transport).await;
    if lost {
        anyhow::bail!("All tunnels stopped: connection to {} was lost", transport.target());
    }
    println!("{}", "✓ Tunnels stopped".green().bold());
    Ok(())
}

async fn run_forward(args: ForwardArgs) -> Result<()> {
    let (name, local_port, remote_host, remote_port) = match args.mapping {
        Some(name) => {
            let mapping = open_store()?
                .get(&name)?
                .ok_or_else(|| anyhow::anyhow!("Mapping '{}' not found", name))?;
            (
                mapping.name,
                mapping.local_port,
                mapping.remote_host,
                mapping.remote_port,
            )
        }
        None => match (args.local_port, args.remote_host, args.remote_port) {
            (Some(local), Some(host), Some(port)) => ("forward".to_string(), local, host, port),
            _ => anyhow::bail!("LOCAL_PORT, REMOTE_HOST and REMOTE_PORT are required"),
        },
    };

    let config = load_connection()?;
    let transport = connect(&config).await?;

    let handle = ForwardTunnel::new(transport.clone(), name, local_port, remote_host, remote_port)
        .bind_address(args.bind_address)
        .max_connections(args.max_connections)
        .start()
        .await?;

    println!();
    println!(
        "{}",
        format!("✓ Forwarding {}", handle.endpoint()).green().bold()
    );
    println!("{}", "Tunnel is running. Press Ctrl+C to stop.".dimmed());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    handle.shutdown().await;
    disconnect(&transport).await;
    println!("{}", "✓ Tunnel stopped".green().bold());
    Ok(())
}

async fn test_connection() -> Result<()> {
    let config = load_connection()?;

    let progress = spinner(format!("Testing {}...", config.display_target()));
    let result = SshTransport::test_connection(&config).await;
    progress.finish_and_clear();

    result.with_context(|| format!("Connection to {} failed", config.display_target()))?;
    println!(
        "{} SSH connection to {} works",
        "✓".green(),
        config.display_target().bold()
    );
    Ok(())
}
