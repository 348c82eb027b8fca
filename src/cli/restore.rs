//! `restore` subcommand.

use std::path::PathBuf;

use clap::Args;

use crate::Result;

#[derive(Args)]
pub struct RestoreArgs {
    pub version_id: i64,
    /// Destination path; must be absolute and inside an active watched root.
    /// Defaults to the version's original path.
    pub dest: Option<PathBuf>,
}

pub async fn run(args: RestoreArgs, config_path: Option<&std::path::Path>) -> Result<()> {
    let engine = super::open_engine(config_path)?;
    let outcome = engine.restore(args.version_id, args.dest)?;
    println!(
        "{}: v{} restored to {}",
        outcome.status,
        outcome.version.version_number,
        outcome.path.display()
    );
    Ok(())
}
