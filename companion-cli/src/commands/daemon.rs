//! `companion daemon`: liaison process lifecycle.

use anyhow::{Context, Result};
use clap::Subcommand;

use companion_daemon::paths::socket_path;
use companion_daemon::{request_status, request_stop, start_blocking, CompanionError};

use super::{home, print_json};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the liaison in the foreground (session actor + control socket).
    Start,
    /// Request graceful shutdown over the control socket.
    Stop,
    /// Print the raw runtime status as JSON.
    Status,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = home()?;

    match command {
        DaemonCommand::Start => {
            start_blocking(&home).context("companion exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("companion stop requested"),
            Err(CompanionError::NotRunning { .. }) => {
                println!("companion is not running");
            }
            Err(err) => return Err(err).context("failed to stop companion"),
        },
        DaemonCommand::Status => match request_status(&home) {
            Ok(status) => print_json(&status)?,
            Err(CompanionError::NotRunning { .. }) => {
                print_json(&serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }))?;
            }
            Err(err) => return Err(err).context("failed to query companion status"),
        },
    }

    Ok(())
}
