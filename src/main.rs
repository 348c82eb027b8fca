//! filekeep — local, always-on file-history engine.
//!
//! This binary is a thin request-handler layer over [`filekeep::engine::Engine`];
//! see the crate docs for the core's design.

use clap::Parser;
use filekeep::cli::{init_logging, Cli, Commands};
use filekeep::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Watch(cmd) => filekeep::cli::watch::run_watch(cmd, config_path).await,
        Commands::Relink(args) => filekeep::cli::watch::run_relink(args, config_path).await,
        Commands::Versions(args) => filekeep::cli::versions::run_versions(args, config_path).await,
        Commands::Current(args) => filekeep::cli::versions::run_current(args, config_path).await,
        Commands::Show(args) => filekeep::cli::versions::run_show(args, config_path).await,
        Commands::Restore(args) => filekeep::cli::restore::run(args, config_path).await,
        Commands::Events(args) => filekeep::cli::events::run(args, config_path).await,
        Commands::Gc(args) => filekeep::cli::gc::run(args, config_path).await,
        Commands::Fsck(args) => filekeep::cli::fsck::run(args, config_path).await,
        Commands::Serve(args) => filekeep::cli::serve::run(args, config_path).await,
    }
}
