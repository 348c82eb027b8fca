//! `gc` subcommand: run one garbage-collection pass immediately, outside the
//! periodic GC thread's schedule.

use std::path::Path;

use clap::Args;

use crate::config::GC_GRACE_PERIOD;
use crate::Result;

#[derive(Args)]
pub struct GcArgs {
    /// Override the default grace period, in seconds.
    #[arg(long)]
    pub grace_seconds: Option<u64>,
}

pub async fn run(args: GcArgs, config_path: Option<&Path>) -> Result<()> {
    let engine = super::open_engine(config_path)?;
    let grace = args
        .grace_seconds
        .map(std::time::Duration::from_secs)
        .unwrap_or(GC_GRACE_PERIOD);

    let active = engine.active_storage_basenames()?;
    let report = engine.cas().gc(&active, grace);

    println!("removed {} objects, freed {} bytes", report.removed.len(), report.freed_bytes);
    for error in &report.errors {
        eprintln!("gc error: {error}");
    }
    Ok(())
}
