//! Command-line interface: a thin request-handler layer over [`crate::engine::Engine`].
//! This is the one place in the crate allowed to hold a Tokio runtime and
//! `.await` — the core itself never does.

use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;
use tracing_subscriber::EnvFilter;

pub mod events;
pub mod fsck;
pub mod gc;
pub mod restore;
pub mod serve;
pub mod versions;
pub mod watch;

use std::sync::Arc;

use crate::config::Config;
use crate::engine::Engine;
use crate::Result;

/// Load the configuration (or fall back to defaults) and open the engine's
/// database and CAS store at `storage_root/filekeep.sqlite`.
pub fn open_engine(config_path: Option<&std::path::Path>) -> Result<Arc<Engine>> {
    let config = match config_path {
        Some(path) if path.exists() => Config::load(path)?,
        _ => Config::default(),
    };
    let db_path = config.storage_root.join("filekeep.sqlite");
    Ok(Arc::new(Engine::open(config, db_path)?))
}

#[derive(Parser)]
#[command(name = "filekeep")]
#[command(about = "Local, always-on file-history engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Reduce log output to warnings and above.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Log format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    /// Path to the configuration file.
    #[arg(long, short = 'c', global = true, env = "FILEKEEP_CONFIG")]
    pub config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage watched roots.
    #[command(subcommand)]
    Watch(watch::WatchCommand),
    /// Relink a watched root to a new location.
    Relink(watch::RelinkArgs),
    /// List the version history of a tracked file.
    Versions(versions::VersionsArgs),
    /// Show the current on-disk hash vs the newest recorded version.
    Current(versions::CurrentArgs),
    /// Print the content of a specific version.
    Show(versions::ShowArgs),
    /// Restore a version to disk.
    Restore(restore::RestoreArgs),
    /// Print recent filesystem events.
    Events(events::EventsArgs),
    /// Run one garbage-collection pass immediately.
    Gc(gc::GcArgs),
    /// Diagnose orphan chunks and unreferenced manifests.
    Fsck(fsck::FsckArgs),
    /// Run the watcher, GC and worker threads until interrupted.
    Serve(serve::ServeArgs),
}

pub fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.quiet { Level::WARN } else { Level::INFO };
    let filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

    match cli.log_format {
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
    }
    Ok(())
}
