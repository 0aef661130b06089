pub mod alarm;
pub mod daemon;
pub mod dump;
pub mod event;
pub mod session;
pub mod status;

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

pub(crate) fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render JSON")?
    );
    Ok(())
}
