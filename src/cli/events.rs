//! `events` subcommand: print recent filesystem events.

use clap::Args;

use crate::Result;

#[derive(Args)]
pub struct EventsArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: i64,
}

pub async fn run(args: EventsArgs, config_path: Option<&std::path::Path>) -> Result<()> {
    let engine = super::open_engine(config_path)?;
    let events = engine.recent_events(args.limit)?;
    for event in events {
        match event.dest_path {
            Some(dest) => println!("{}\t{}\t{} -> {}", event.timestamp, event.event_type, event.src_path, dest),
            None => println!("{}\t{}\t{}", event.timestamp, event.event_type, event.src_path),
        }
    }
    Ok(())
}
