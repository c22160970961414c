// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Relay Contributors

// SSH Relay - Runner
// Starts every stored reverse mapping over one SSH connection and keeps
// them up until a shutdown signal

mod config;
mod pidfile;
mod runner;

use std::process::ExitCode;

use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ssh_relayd=info,ssh_relay_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("SSH Relay runner starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        "Build: {} ({})",
        option_env!("BUILD_DATE").unwrap_or("unknown"),
        option_env!("GIT_HASH").unwrap_or("unknown")
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        signal.cancel();
    });

    let status = match runner::run(&shutdown).await {
        Ok(status) => status,
        Err(abort) => {
            error!("{:#}", abort.error);
            eprintln!("{} {:#}", "Error:".red().bold(), abort.error);
            abort.status
        }
    };

    info!("Runner exiting with status {}", status.code());
    ExitCode::from(status.code())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to install SIGTERM handler");

    #[cfg(unix)]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    };

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }
}
