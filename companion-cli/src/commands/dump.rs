//! `companion dump`: crash-storm guard diagnostics.

use anyhow::{Context, Result};
use clap::Args;

use companion_daemon::{send_request, CompanionRequest};

use super::{home, print_json};

#[derive(Args, Debug)]
pub struct DumpArgs {
    /// Print the structured report instead of the text rendering.
    #[arg(long)]
    pub json: bool,
}

impl DumpArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;

        if !self.json {
            let text = companion_daemon::request_dump(&home).context("failed to dump companion")?;
            print!("{text}");
            return Ok(());
        }

        let response = send_request(&home, &CompanionRequest::command("dump"))
            .context("failed to dump companion")?;
        if !response.ok {
            anyhow::bail!(
                "failed to dump companion: {}",
                response.error.unwrap_or_default()
            );
        }
        let report = response
            .data
            .and_then(|data| data.get("report").cloned())
            .context("dump response missing report")?;
        print_json(&report)
    }
}
