//! `companion status`: session and alarm overview.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use companion_core::{AlarmRequest, DeletedConfigRecord};
use companion_daemon::{request_status, CompanionError};

use super::{home, print_json};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit the full runtime status as JSON.
    #[arg(long)]
    pub json: bool,
}

// Subset of the session block the table view needs.
#[derive(Debug, Deserialize)]
struct SessionView {
    connected: bool,
    generation: u64,
    listeners: Vec<String>,
    pending_alarms: Vec<AlarmRequest>,
    recorded_deaths: usize,
    deleted_configs: Vec<DeletedConfigRecord>,
    inventory_in_flight: usize,
}

#[derive(Tabled)]
struct AlarmRow {
    #[tabled(rename = "alarm")]
    kind: String,
    #[tabled(rename = "fires at (ms since boot)")]
    fire_at: i64,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let status = match request_status(&home) {
            Ok(status) => status,
            Err(CompanionError::NotRunning { .. }) => {
                if self.json {
                    return print_json(&serde_json::json!({ "running": false }));
                }
                println!("{} companion is not running", "■".red().bold());
                return Ok(());
            }
            Err(err) => return Err(err).context("failed to query companion status"),
        };

        if self.json {
            return print_json(&status);
        }

        let session: SessionView = serde_json::from_value(status["session"].clone())
            .context("companion status missing session block")?;
        for line in render(&status, &session) {
            println!("{line}");
        }
        Ok(())
    }
}

fn render(status: &Value, session: &SessionView) -> Vec<String> {
    let mut lines = Vec::new();

    let marker = if session.connected {
        "■".green().bold()
    } else {
        "■".yellow().bold()
    };
    let state = if session.connected {
        "connected"
    } else {
        "disconnected"
    };
    lines.push(format!(
        "{marker} stats daemon {state} (generation {})",
        session.generation
    ));

    let listeners = if session.listeners.is_empty() {
        "none".to_string()
    } else {
        session.listeners.join(", ")
    };
    lines.push(format!("listeners: {listeners}"));
    lines.push(format!(
        "deaths recorded: {}, configs deleted: {}, inventory streams in flight: {}",
        session.recorded_deaths,
        session.deleted_configs.len(),
        session.inventory_in_flight
    ));
    if let Some(requests) = status["control_requests"].as_u64() {
        lines.push(format!("control requests served: {requests}"));
    }

    if session.pending_alarms.is_empty() {
        lines.push("no pending alarms".to_string());
    } else {
        let rows = session.pending_alarms.iter().map(|alarm| AlarmRow {
            kind: alarm.kind.to_string(),
            fire_at: alarm.fire_at_elapsed_millis,
        });
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        lines.push(table.to_string());
    }

    lines
}
