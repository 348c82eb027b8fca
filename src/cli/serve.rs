//! `serve` subcommand: the long-running process. Starts the watcher, GC and
//! backup-worker threads, then blocks on the event bus and Ctrl+C — the
//! only place in the crate that awaits inside a request handler.

use std::path::Path;

use clap::Args;
use tracing::info;

use crate::bus::Envelope;
use crate::Result;

#[derive(Args)]
pub struct ServeArgs {
    /// Print every published event to stdout as it arrives.
    #[arg(long)]
    pub print_events: bool,
}

pub async fn run(args: ServeArgs, config_path: Option<&Path>) -> Result<()> {
    let engine = super::open_engine(config_path)?;
    engine.start()?;
    info!("filekeep core started");

    let mut events = engine.snapshot_progress();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                engine.shutdown();
                break;
            }
            received = events.recv() => {
                match received {
                    Ok(Envelope { event, timestamp }) if args.print_events => {
                        println!("{timestamp} {event:?}");
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}
