//! `versions` / `current` / `show` subcommands.

use std::path::PathBuf;

use clap::Args;

use crate::engine::VersionContent;
use crate::Result;

#[derive(Args)]
pub struct VersionsArgs {
    pub path: PathBuf,
}

#[derive(Args)]
pub struct CurrentArgs {
    pub path: PathBuf,
}

#[derive(Args)]
pub struct ShowArgs {
    pub version_id: i64,
}

pub async fn run_versions(args: VersionsArgs, config_path: Option<&std::path::Path>) -> Result<()> {
    let engine = super::open_engine(config_path)?;
    let versions = engine.list_versions(&args.path)?;
    if versions.is_empty() {
        println!("no versions recorded for {}", args.path.display());
        return Ok(());
    }
    for version in versions {
        println!(
            "v{}\t{}\t{}\t{}",
            version.version_number,
            version.file_hash.as_deref().unwrap_or("-"),
            version.file_size_bytes.unwrap_or(0),
            version.created_at,
        );
    }
    Ok(())
}

pub async fn run_current(args: CurrentArgs, config_path: Option<&std::path::Path>) -> Result<()> {
    let engine = super::open_engine(config_path)?;
    let current = engine.current_version(&args.path)?;
    println!("on-disk hash:   {}", current.file_hash.as_deref().unwrap_or("(unreadable)"));
    println!("matches newest: {}", current.matches_version);
    if let Some(number) = current.version_number {
        println!("newest version: v{number} (id {})", current.version_id.unwrap());
    } else {
        println!("newest version: none");
    }
    Ok(())
}

pub async fn run_show(args: ShowArgs, config_path: Option<&std::path::Path>) -> Result<()> {
    let engine = super::open_engine(config_path)?;
    match engine.version_content(args.version_id)? {
        VersionContent::Text(text) => print!("{text}"),
        VersionContent::Binary => println!("[binary]"),
    }
    Ok(())
}
