//! `vigil heartbeat` subcommands.

use std::sync::Arc;

use clap::Subcommand;

use vigil_config::VigilConfig;
use vigil_cron::store::CronStore;
use vigil_cron::RunStatus;
use vigil_runtime::channels::ChannelRegistry;
use vigil_runtime::heartbeat::{Heartbeat, HEARTBEAT_JOB_NAME};

use crate::jobs::format_ms;
use crate::run::FileConfigWriter;

#[derive(Subcommand)]
pub enum HeartbeatCommand {
    /// Enable the heartbeat (creates its job on first use)
    Enable,
    /// Disable the heartbeat
    Disable,
    /// Show heartbeat configuration and job state
    Status,
}

pub async fn run_heartbeat(command: HeartbeatCommand) -> anyhow::Result<()> {
    let config = vigil_config::load_config()?;
    match command {
        HeartbeatCommand::Enable => set_enabled(config, true).await,
        HeartbeatCommand::Disable => set_enabled(config, false).await,
        HeartbeatCommand::Status => print_status(&config),
    }
}

async fn set_enabled(config: VigilConfig, enabled: bool) -> anyhow::Result<()> {
    let (scheduler, events, shutdown) = crate::run::open_scheduler(&config)?;
    let engine = crate::run::engine_from_config(&config.engine)?;
    let heartbeat = Heartbeat::new(
        events,
        engine,
        Arc::new(ChannelRegistry::new()),
        scheduler,
        Arc::new(FileConfigWriter),
        config.heartbeat.clone(),
    );

    let result = heartbeat.set_enabled(enabled).await;
    shutdown.cancel();
    result?;

    println!("Heartbeat {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

fn print_status(config: &VigilConfig) -> anyhow::Result<()> {
    println!(
        "heartbeat: {}",
        if config.heartbeat.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!("  every: {}", config.heartbeat.every);
    match &config.heartbeat.active_hours {
        Some(hours) => println!(
            "  active hours: {}-{} ({})",
            hours.start,
            hours.end,
            hours.timezone.as_deref().unwrap_or("host-local")
        ),
        None => println!("  active hours: always"),
    }

    // Job state straight from the store; no scheduler needed.
    let store = CronStore::open(config.jobs_path()?)?;
    let jobs = store.load()?;
    match jobs.iter().find(|j| j.name == HEARTBEAT_JOB_NAME) {
        Some(job) => {
            println!(
                "  job: {} ({})",
                job.id,
                if job.enabled { "enabled" } else { "disabled" }
            );
            println!("  next run: {}", format_ms(job.state.next_run_at_ms));
            println!("  last run: {}", format_ms(job.state.last_run_at_ms));
            if let Some(status) = &job.state.last_status {
                let label = match status {
                    RunStatus::Ok => "ok",
                    RunStatus::Error => "error",
                };
                println!("  last status: {label}");
            }
        }
        None => println!("  job: not created yet"),
    }
    Ok(())
}
