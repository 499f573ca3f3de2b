mod events;
mod heartbeat;
mod http;
mod jobs;
mod run;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vigil", about = "Scheduled jobs and heartbeat for a conversational agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon until Ctrl-C
    Run,

    /// Manage scheduled jobs
    #[command(subcommand)]
    Job(jobs::JobCommand),

    /// Inspect the event log
    #[command(subcommand)]
    Events(events::EventsCommand),

    /// Control the periodic heartbeat
    #[command(subcommand)]
    Heartbeat(heartbeat::HeartbeatCommand),

    /// Show configuration and state paths
    Health,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run::run_daemon())?;
        }
        Commands::Job(command) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(jobs::run_job(command))?;
        }
        Commands::Events(command) => events::run_events(command)?,
        Commands::Heartbeat(command) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(heartbeat::run_heartbeat(command))?;
        }
        Commands::Health => run::print_health()?,
    }

    Ok(())
}
