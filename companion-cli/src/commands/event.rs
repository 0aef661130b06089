//! `companion event`: deliver one host event to the liaison.

use anyhow::{Context, Result};
use clap::Args;

use companion_daemon::{request_broadcast, RelayEvent};

use super::{home, print_json};

#[derive(Args, Debug)]
pub struct EventArgs {
    /// Event as JSON, e.g. `{"event":"package_removed","package":"com.example","uid":10001}`.
    #[arg(value_parser = parse_event)]
    pub event: RelayEvent,
}

impl EventArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let outcome = request_broadcast(&home, self.event).context("failed to relay event")?;
        print_json(&outcome)
    }
}

fn parse_event(raw: &str) -> std::result::Result<RelayEvent, String> {
    serde_json::from_str(raw).map_err(|err| format!("invalid event JSON: {err}"))
}
