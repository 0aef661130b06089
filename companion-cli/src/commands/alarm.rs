//! `companion alarm`: schedule or cancel single-shot wake-ups.

use anyhow::{Context, Result};
use clap::Subcommand;

use companion_core::{AlarmKind, ElapsedMillis};
use companion_daemon::{request_cancel_alarm, request_set_alarm};

use super::home;

#[derive(Subcommand, Debug)]
pub enum AlarmCommand {
    /// Replace any pending alarm of this kind with one at `timestamp_ms`.
    Set {
        /// anomaly, periodic, or pulling.
        kind: AlarmKind,
        /// Deadline in milliseconds since boot.
        timestamp_ms: ElapsedMillis,
    },
    /// Cancel the pending alarm of this kind, if any.
    Cancel { kind: AlarmKind },
}

pub fn run(command: AlarmCommand) -> Result<()> {
    let home = home()?;

    match command {
        AlarmCommand::Set { kind, timestamp_ms } => {
            request_set_alarm(&home, kind, timestamp_ms)
                .with_context(|| format!("failed to set {kind} alarm"))?;
            println!("{kind} alarm set for {timestamp_ms} ms since boot");
        }
        AlarmCommand::Cancel { kind } => {
            let data = request_cancel_alarm(&home, kind)
                .with_context(|| format!("failed to cancel {kind} alarm"))?;
            if data["was_pending"].as_bool().unwrap_or(false) {
                println!("{kind} alarm cancelled");
            } else {
                println!("no {kind} alarm was pending");
            }
        }
    }

    Ok(())
}
