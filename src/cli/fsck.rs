//! `fsck` subcommand: diagnostic salvage report, never mutates the store.

use std::path::Path;

use clap::Args;

use crate::recovery::fsck;
use crate::Result;

#[derive(Args)]
pub struct FsckArgs {
    /// Print the full report as JSON instead of a summary.
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: FsckArgs, config_path: Option<&Path>) -> Result<()> {
    let engine = super::open_engine(config_path)?;
    let report = fsck(engine.storage_root())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("manifests checked: {}", report.manifests_checked);
    println!("orphan chunks:      {}", report.orphan_chunks.len());
    println!("broken manifests:   {}", report.broken_manifests.len());
    for broken in &report.broken_manifests {
        println!(
            "  {} ({}): missing {} chunk(s)",
            broken.manifest_path.display(),
            broken.file_hash,
            broken.missing_chunks.len()
        );
    }
    Ok(())
}
