//! Companion: liaison between the stats daemon and host services.
//!
//! # Usage
//!
//! ```text
//! companion daemon start|stop|status
//! companion status [--json]
//! companion ready
//! companion snapshot
//! companion alarm set <anomaly|periodic|pulling> <timestamp_ms>
//! companion alarm cancel <anomaly|periodic|pulling>
//! companion event '<json>'
//! companion dump [--json]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    alarm::AlarmCommand, daemon::DaemonCommand, dump::DumpArgs, event::EventArgs,
    status::StatusArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "companion",
    version,
    about = "Bridge the stats daemon to host alarms, inventory, and events",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run or control the liaison process.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Summarize the session, listeners, and pending alarms.
    Status(StatusArgs),

    /// Tell the liaison the stats daemon is up.
    Ready,

    /// Ask the liaison to resend the full app inventory.
    Snapshot,

    /// Schedule or cancel a wake-up on the daemon's behalf.
    Alarm {
        #[command(subcommand)]
        command: AlarmCommand,
    },

    /// Deliver a host event (JSON) to the liaison.
    Event(EventArgs),

    /// Print the crash-storm guard's diagnostic report.
    Dump(DumpArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Status(args) => args.run(),
        Commands::Ready => commands::session::ready(),
        Commands::Snapshot => commands::session::snapshot(),
        Commands::Alarm { command } => commands::alarm::run(command),
        Commands::Event(args) => args.run(),
        Commands::Dump(args) => args.run(),
    }
}
