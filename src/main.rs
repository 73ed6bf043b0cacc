//! # confab

use cata::execute;
use clap::Parser;
use confab::cli::Root;
use eyre::Result;
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::config::HookBuilder::default()
        .display_env_section(false)
        .display_location_section(false)
        .install()?;

    let root = Root::parse();
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigterm.recv() => Ok(()),
        result = execute(&root) => result,
    }
}
