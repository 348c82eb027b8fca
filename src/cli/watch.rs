//! `watch` / `relink` subcommands: manage the set of watched roots.

use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::Result;

#[derive(Subcommand)]
pub enum WatchCommand {
    /// Add a root directory to watch, triggering an initial snapshot scan.
    Add(AddArgs),
    /// Stop watching a root (soft delete; history is retained).
    Remove(RemoveArgs),
    /// List configured roots.
    List,
}

#[derive(Args)]
pub struct AddArgs {
    /// Absolute path to watch.
    pub path: PathBuf,
}

#[derive(Args)]
pub struct RemoveArgs {
    /// The watched root's id, as shown by `watch list`.
    pub id: i64,
}

#[derive(Args)]
pub struct RelinkArgs {
    /// Current path of the watched root.
    pub old: PathBuf,
    /// New path for the watched root.
    pub new: PathBuf,
    /// Also move the files on disk, not just the tracked records.
    #[arg(long)]
    pub move_files: bool,
}

pub async fn run_watch(cmd: WatchCommand, config_path: Option<&std::path::Path>) -> Result<()> {
    let engine = super::open_engine(config_path)?;

    match cmd {
        WatchCommand::Add(args) => {
            let id = engine.add_watched_root(&args.path)?;
            println!("watching {} (id {id})", args.path.display());

            let storage_root = engine.storage_root().to_path_buf();
            let scanner = crate::scanner::SnapshotScanner::new(
                engine.database(),
                engine.queue(),
                engine.queue().exclusions(),
                engine.event_bus(),
                false,
                true,
            );
            let stats = scanner.scan(&storage_root, &args.path)?;
            println!(
                "initial scan: {} processed, {} skipped, {} errors",
                stats.processed_files, stats.skipped_files, stats.error_count
            );
        }
        WatchCommand::Remove(args) => {
            engine.remove_watched_root(args.id)?;
            println!("stopped watching root {}", args.id);
        }
        WatchCommand::List => {
            let db = engine.database();
            let rows: Vec<(i64, String, bool)> = db.with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT id, path, is_active FROM watched_paths ORDER BY id")?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? != 0)))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })?;
            for (id, path, active) in rows {
                println!("{id}\t{path}\t{}", if active { "active" } else { "inactive" });
            }
        }
    }
    Ok(())
}

pub async fn run_relink(args: RelinkArgs, config_path: Option<&std::path::Path>) -> Result<()> {
    let engine = super::open_engine(config_path)?;
    let count = engine.relink_root(&args.old, &args.new, args.move_files)?;
    println!("relinked {} to {} ({count} identities rewritten)", args.old.display(), args.new.display());
    Ok(())
}
