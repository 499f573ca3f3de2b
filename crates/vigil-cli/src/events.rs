//! `vigil events` subcommands.

use clap::Subcommand;

use vigil_events::{EventLog, EventQuery};

#[derive(Subcommand)]
pub enum EventsCommand {
    /// Print event log entries as JSON lines
    Tail {
        /// Only entries with seq greater than this
        #[arg(long, default_value_t = 0)]
        after_seq: u64,

        /// Only entries of this event type (e.g. "cron.fire")
        #[arg(long = "type")]
        event_type: Option<String>,

        /// At most this many entries
        #[arg(long)]
        limit: Option<usize>,
    },
}

pub fn run_events(command: EventsCommand) -> anyhow::Result<()> {
    match command {
        EventsCommand::Tail {
            after_seq,
            event_type,
            limit,
        } => {
            let config = vigil_config::load_config()?;
            let events = EventLog::open_with(config.events_path()?, config.events.buffer_size)?;
            let entries = events.read(&EventQuery {
                after_seq,
                event_type,
                limit,
            })?;
            for entry in &entries {
                println!("{}", serde_json::to_string(entry)?);
            }
            Ok(())
        }
    }
}
