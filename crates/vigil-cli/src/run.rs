//! The `vigil run` daemon and shared process wiring.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vigil_config::{EngineConfig, VigilConfig};
use vigil_cron::scheduler::CronScheduler;
use vigil_cron::store::CronStore;
use vigil_events::EventLog;
use vigil_runtime::channels::ChannelRegistry;
use vigil_runtime::engine::ConversationEngine;
use vigil_runtime::heartbeat::{ConfigWriter, Heartbeat, HEARTBEAT_JOB_NAME};
use vigil_runtime::listener::JobListener;
use vigil_types::{AskOptions, EngineReply};

use crate::http::{HttpEngine, WebhookChannel};

/// Open the event log and spawn a scheduler over the shared store.
pub fn open_scheduler(
    config: &VigilConfig,
) -> anyhow::Result<(CronScheduler, Arc<EventLog>, CancellationToken)> {
    let events = Arc::new(EventLog::open_with(
        config.events_path()?,
        config.events.buffer_size,
    )?);
    let store = CronStore::open(config.jobs_path()?)?;
    let shutdown = CancellationToken::new();
    let scheduler = CronScheduler::spawn(store, events.clone(), shutdown.clone())?;
    Ok((scheduler, events, shutdown))
}

/// Build the configured engine client, or a stand-in that fails every
/// call when `engine.url` is unset.
pub fn engine_from_config(config: &EngineConfig) -> anyhow::Result<Arc<dyn ConversationEngine>> {
    Ok(match &config.url {
        Some(url) => Arc::new(HttpEngine::new(url.clone(), config.timeout_secs)?),
        None => Arc::new(OfflineEngine),
    })
}

struct OfflineEngine;

#[async_trait::async_trait]
impl ConversationEngine for OfflineEngine {
    async fn ask_with_session(
        &self,
        _prompt: &str,
        _session: &str,
        _options: &AskOptions,
    ) -> anyhow::Result<EngineReply> {
        anyhow::bail!("engine.url is not configured")
    }

    async fn ask(&self, _prompt: &str) -> anyhow::Result<EngineReply> {
        anyhow::bail!("engine.url is not configured")
    }
}

/// Persists config sections through the default config file.
pub struct FileConfigWriter;

impl ConfigWriter for FileConfigWriter {
    fn write_section(
        &self,
        name: &str,
        value: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        // Echo the section back as the typed config serializes it, with
        // defaults filled in.
        let config = vigil_config::write_config_section(name, value)?;
        let mut doc = serde_json::to_value(&config)?;
        Ok(doc
            .get_mut(name)
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null))
    }
}

pub async fn run_daemon() -> anyhow::Result<()> {
    let config = vigil_config::load_config()?;
    let (scheduler, events, shutdown) = open_scheduler(&config)?;

    let registry = Arc::new(ChannelRegistry::new());
    match &config.delivery.webhook_url {
        Some(url) => {
            registry.register(Arc::new(WebhookChannel::new(url.clone())));
            info!("Registered webhook delivery channel");
        }
        None => info!("No delivery channel configured; replies will only be logged"),
    }

    if config.engine.url.is_none() {
        warn!("engine.url is not configured; job and heartbeat runs will fail");
    }
    let engine = engine_from_config(&config.engine)?;

    let listener = JobListener::new(
        events.clone(),
        engine.clone(),
        registry.clone(),
        vec![HEARTBEAT_JOB_NAME.to_string()],
    );
    listener.start();

    let heartbeat = Heartbeat::new(
        events.clone(),
        engine,
        registry,
        scheduler.clone(),
        Arc::new(FileConfigWriter),
        config.heartbeat.clone(),
    );
    if config.heartbeat.enabled {
        heartbeat.set_enabled(true).await?;
    } else {
        heartbeat.start();
    }

    scheduler.start().await?;
    info!("vigil is running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    scheduler.stop().await?;
    heartbeat.stop();
    listener.stop();
    shutdown.cancel();
    events.close();
    Ok(())
}

pub fn print_health() -> anyhow::Result<()> {
    let config = vigil_config::load_config()?;
    println!("vigil is healthy");
    println!("  config file: {}", vigil_config::config_file_path()?.display());
    println!("  event log: {}", config.events_path()?.display());
    println!("  job store: {}", config.jobs_path()?.display());
    println!(
        "  engine url: {}",
        config.engine.url.as_deref().unwrap_or("(unset)")
    );
    println!(
        "  webhook url: {}",
        config.delivery.webhook_url.as_deref().unwrap_or("(unset)")
    );
    println!(
        "  heartbeat: {}",
        if config.heartbeat.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    Ok(())
}
