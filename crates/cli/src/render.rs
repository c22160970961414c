// SSH Relay - CLI output helpers

use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};

use ssh_relay_common::{format_host_port, PortHealth, PortStatus, TunnelMapping};
use ssh_relay_core::{MappingOutcome, Preflight};

fn header(title: &str) -> Cell {
    Cell::new(title)
        .add_attribute(Attribute::Bold)
        .fg(Color::Cyan)
}

pub fn direction(mapping: &TunnelMapping) -> &'static str {
    if mapping.is_reverse() {
        "reverse"
    } else {
        "forward"
    }
}

/// Where traffic enters and where it ends up
pub fn route(mapping: &TunnelMapping) -> String {
    match mapping.server_bind_port {
        Some(bind_port) => format!(
            "{} → localhost:{}",
            format_host_port(&mapping.remote_host, bind_port),
            mapping.local_port
        ),
        None => format!(
            "localhost:{} → {}",
            mapping.local_port,
            format_host_port(&mapping.remote_host, mapping.remote_port)
        ),
    }
}

pub fn mappings_table(mappings: &[TunnelMapping]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        header("Name"),
        header("Direction"),
        header("Route"),
        header("Description"),
        header("Created"),
    ]);

    for mapping in mappings {
        table.add_row(vec![
            Cell::new(&mapping.name).fg(Color::Green),
            Cell::new(direction(mapping)),
            Cell::new(route(mapping)),
            Cell::new(mapping.description.as_deref().unwrap_or("-")).fg(Color::DarkGrey),
            Cell::new(mapping.created_at.format("%Y-%m-%d %H:%M")).fg(Color::DarkGrey),
        ]);
    }

    table
}

pub fn health_line(health: &PortHealth) -> String {
    match health.status {
        PortStatus::Healthy => format!(
            "{} Port {} is {}: a process is listening",
            "✓".green(),
            health.port,
            "healthy".green().bold()
        ),
        PortStatus::Zombie => format!(
            "{} Port {} is {}: nothing is listening",
            "✗".red(),
            health.port,
            "zombie".red().bold()
        ),
        PortStatus::Error => format!(
            "{} Port {}: {} (the remote query failed)",
            "?".yellow(),
            health.port,
            "unknown".yellow().bold()
        ),
    }
}

fn mark(ok: bool) -> colored::ColoredString {
    if ok {
        "✓".green()
    } else {
        "✗".red()
    }
}

pub fn outcome_line(outcome: &MappingOutcome) -> String {
    format!("{} {}", mark(outcome.succeeded()), outcome)
}

pub fn preflight_line(name: &str, preflight: &Preflight) -> String {
    format!("{} {} {}", mark(!preflight.needs_attention()), name, preflight)
}
