//! `companion ready` and `companion snapshot`.

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::Value;

use companion_daemon::{request_ready, request_snapshot};

use super::home;

pub fn ready() -> Result<()> {
    let home = home()?;
    let outcome = request_ready(&home).context("failed to signal daemon readiness")?;
    println!("{}", describe_ready(&outcome));
    Ok(())
}

pub fn snapshot() -> Result<()> {
    let home = home()?;
    let data = request_snapshot(&home).context("failed to request an inventory snapshot")?;
    let line = match data["snapshot"].as_str() {
        Some("started") => "inventory transmission started".green().to_string(),
        Some("no_daemon") => "no stats daemon connected".yellow().to_string(),
        Some(other) => format!("snapshot {other}").red().to_string(),
        None => data.to_string(),
    };
    println!("{line}");
    Ok(())
}

fn describe_ready(outcome: &Value) -> String {
    let generation = outcome["generation"].as_u64().unwrap_or_default();
    match outcome["outcome"].as_str() {
        Some("connected") => format!("connected (generation {generation})")
            .green()
            .to_string(),
        Some("already_connected") => format!("already connected (generation {generation})")
            .green()
            .to_string(),
        Some("daemon_not_found") => "stats daemon not found".yellow().to_string(),
        Some("handshake_failed") => format!(
            "handshake failed: {}",
            outcome["reason"].as_str().unwrap_or("unknown")
        )
        .red()
        .to_string(),
        _ => outcome.to_string(),
    }
}
