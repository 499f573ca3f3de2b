//! Periodic heartbeat: a scheduled self-check that only speaks up
//! when something needs the user's attention.
//!
//! The heartbeat owns one scheduled job (named [`HEARTBEAT_JOB_NAME`])
//! and consumes only that job's fire events. Each fire walks a fixed
//! pipeline: active-hours window, engine call, structured reply parse,
//! duplicate suppression, delivery. Every outcome is recorded in the
//! event log, so a quiet heartbeat is still an auditable one.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, NaiveTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use vigil_config::HeartbeatConfig;
use vigil_cron::scheduler::CronScheduler;
use vigil_cron::{CronFire, JobCreate, JobPatch, Schedule, EVENT_CRON_FIRE};
use vigil_events::{EventLog, Subscription};
use vigil_types::{ActiveHours, AskOptions};

use crate::channels::DeliveryResolver;
use crate::engine::ConversationEngine;

/// Name of the scheduled job the heartbeat claims.
pub const HEARTBEAT_JOB_NAME: &str = "heartbeat";
/// Engine session shared by all heartbeat runs.
pub const HEARTBEAT_SESSION: &str = "heartbeat";

/// Appended when a run decided not to message the user.
pub const EVENT_HEARTBEAT_SKIP: &str = "heartbeat.skip";
/// Appended when a run produced a message for the user.
pub const EVENT_HEARTBEAT_DONE: &str = "heartbeat.done";
/// Appended when the engine call failed.
pub const EVENT_HEARTBEAT_ERROR: &str = "heartbeat.error";

/// An identical message is suppressed within this window.
const DEDUP_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

/// Persists one named configuration section.
pub trait ConfigWriter: Send + Sync {
    /// Merge `value` under `name` in the config file and persist it.
    /// Returns the section as stored after validation.
    fn write_section(&self, name: &str, value: serde_json::Value)
        -> anyhow::Result<serde_json::Value>;
}

// ──────────────────── Reply Protocol ────────────────────

/// Verdict extracted from a structured heartbeat reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    /// Nothing needs attention.
    Ok,
    /// The engine wants to message the user.
    ChatYes,
    /// The engine explicitly declined to message the user.
    ChatNo,
}

/// A heartbeat reply after protocol parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatReply {
    pub status: HeartbeatStatus,
    pub reason: Option<String>,
    pub content: Option<String>,
    /// True when no STATUS line was found and the raw reply was
    /// promoted to deliverable content.
    pub unparsed: bool,
}

/// Parse the `STATUS:` / `REASON:` / `CONTENT:` reply protocol.
///
/// Markers are matched case-insensitively at the start of a line.
/// Everything after the `CONTENT:` marker, including any following
/// lines, is the content. A reply without a recognizable status line
/// fails open: it becomes `ChatYes` with the whole raw text as
/// content, flagged `unparsed`.
pub fn parse_heartbeat_reply(raw: &str) -> HeartbeatReply {
    let mut status = None;
    let mut reason: Option<String> = None;
    let mut content_lines: Option<Vec<&str>> = None;

    for line in raw.lines() {
        if let Some(lines) = content_lines.as_mut() {
            lines.push(line);
            continue;
        }
        let trimmed = line.trim();
        if let Some(rest) = strip_prefix_ci(trimmed, "STATUS:") {
            if status.is_none() {
                status = parse_status_value(rest.trim());
            }
        } else if let Some(rest) = strip_prefix_ci(trimmed, "REASON:") {
            if reason.is_none() && !rest.trim().is_empty() {
                reason = Some(rest.trim().to_string());
            }
        } else if let Some(rest) = strip_prefix_ci(trimmed, "CONTENT:") {
            content_lines = Some(vec![rest.trim_start()]);
        }
    }

    match status {
        Some(status) => {
            let content = content_lines
                .map(|lines| lines.join("\n").trim().to_string())
                .filter(|c| !c.is_empty());
            HeartbeatReply {
                status,
                reason,
                content,
                unparsed: false,
            }
        }
        None => {
            let raw = raw.trim();
            HeartbeatReply {
                status: HeartbeatStatus::ChatYes,
                reason: None,
                content: (!raw.is_empty()).then(|| raw.to_string()),
                unparsed: true,
            }
        }
    }
}

fn parse_status_value(value: &str) -> Option<HeartbeatStatus> {
    match value.to_ascii_uppercase().as_str() {
        "HEARTBEAT_OK" => Some(HeartbeatStatus::Ok),
        "CHAT_YES" => Some(HeartbeatStatus::ChatYes),
        "CHAT_NO" => Some(HeartbeatStatus::ChatNo),
        _ => None,
    }
}

fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    if line.len() < prefix.len() || !line.is_char_boundary(prefix.len()) {
        return None;
    }
    line[..prefix.len()]
        .eq_ignore_ascii_case(prefix)
        .then(|| &line[prefix.len()..])
}

// ──────────────────── Active Hours ────────────────────

/// Whether `now` falls inside the window, evaluated in the window's
/// timezone (host-local when absent or unresolvable).
///
/// The window is `[start, end)`; `start > end` wraps overnight. An
/// unparseable start or end leaves the window open.
pub fn within_active_hours(hours: &ActiveHours, now: DateTime<Utc>) -> bool {
    let local_time = match hours
        .timezone
        .as_deref()
        .and_then(|name| chrono_tz::Tz::from_str(name).ok())
    {
        Some(tz) => now.with_timezone(&tz).time(),
        None => now.with_timezone(&chrono::Local).time(),
    };
    let (Some(start), Some(end)) = (parse_hhmm(&hours.start), parse_hhmm(&hours.end)) else {
        return true;
    };
    if start <= end {
        local_time >= start && local_time < end
    } else {
        local_time >= start || local_time < end
    }
}

fn parse_hhmm(text: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(text.trim(), "%H:%M").ok()
}

// ──────────────────── Heartbeat ────────────────────

#[derive(Default)]
struct DedupState {
    last_text: Option<String>,
    last_sent_at_ms: i64,
}

impl DedupState {
    fn is_duplicate(&self, text: &str, now_ms: i64) -> bool {
        self.last_text.as_deref() == Some(text)
            && now_ms - self.last_sent_at_ms < DEDUP_WINDOW_MS
    }

    fn record_attempt(&mut self, text: &str, now_ms: i64) {
        self.last_text = Some(text.to_string());
        self.last_sent_at_ms = now_ms;
    }
}

/// The heartbeat consumer.
///
/// Use `&self` for all operations; state lives behind locks so the
/// fire callback and the control surface can share one instance.
pub struct Heartbeat {
    events: Arc<EventLog>,
    engine: Arc<dyn ConversationEngine>,
    resolver: Arc<dyn DeliveryResolver>,
    scheduler: CronScheduler,
    config_writer: Arc<dyn ConfigWriter>,
    config: Arc<RwLock<HeartbeatConfig>>,
    dedup: Arc<Mutex<DedupState>>,
    busy: Arc<AtomicBool>,
    subscription: Mutex<Option<Subscription>>,
}

impl Heartbeat {
    pub fn new(
        events: Arc<EventLog>,
        engine: Arc<dyn ConversationEngine>,
        resolver: Arc<dyn DeliveryResolver>,
        scheduler: CronScheduler,
        config_writer: Arc<dyn ConfigWriter>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            events,
            engine,
            resolver,
            scheduler,
            config_writer,
            config: Arc::new(RwLock::new(config)),
            dedup: Arc::new(Mutex::new(DedupState::default())),
            busy: Arc::new(AtomicBool::new(false)),
            subscription: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().unwrap().enabled
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> HeartbeatConfig {
        self.config.read().unwrap().clone()
    }

    /// Subscribe to this heartbeat's fire events. Idempotent; must be
    /// called from within a Tokio runtime.
    pub fn start(&self) {
        let mut guard = self.subscription.lock().unwrap();
        if guard.is_some() {
            return;
        }

        let events = self.events.clone();
        let engine = self.engine.clone();
        let resolver = self.resolver.clone();
        let config = self.config.clone();
        let dedup = self.dedup.clone();
        let busy = self.busy.clone();

        let sub = self.events.subscribe_type(
            EVENT_CRON_FIRE,
            Arc::new(move |entry| {
                let fire: CronFire = serde_json::from_value(entry.payload.clone())?;
                if fire.job_name != HEARTBEAT_JOB_NAME {
                    return Ok(());
                }
                if busy
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    debug!("Heartbeat busy, dropping fire event");
                    return Ok(());
                }
                let events = events.clone();
                let engine = engine.clone();
                let resolver = resolver.clone();
                let snapshot = config.read().unwrap().clone();
                let dedup = dedup.clone();
                let busy = busy.clone();
                tokio::spawn(async move {
                    run_heartbeat(&*engine, &*resolver, &events, &dedup, &snapshot).await;
                    busy.store(false, Ordering::SeqCst);
                });
                Ok(())
            }),
        );
        *guard = Some(sub);
    }

    /// Unsubscribe from fire events. An in-flight run finishes.
    pub fn stop(&self) {
        if let Some(sub) = self.subscription.lock().unwrap().take() {
            sub.cancel();
        }
    }

    /// Enable or disable the heartbeat.
    ///
    /// Idempotent bootstrap: ensures the event subscription and the
    /// underlying scheduled job exist (the job is created on first
    /// enable), flips the job's enabled flag, and persists the new
    /// configuration.
    pub async fn set_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        self.start();

        let jobs = self.scheduler.list().await?;
        match jobs.iter().find(|j| j.name == HEARTBEAT_JOB_NAME) {
            Some(job) => {
                self.scheduler
                    .update(
                        &job.id,
                        JobPatch {
                            enabled: Some(enabled),
                            ..JobPatch::default()
                        },
                    )
                    .await?;
            }
            None if enabled => {
                let every = self.config.read().unwrap().every.clone();
                let job = self
                    .scheduler
                    .add(JobCreate {
                        name: HEARTBEAT_JOB_NAME.to_string(),
                        schedule: Schedule::Every { every },
                        payload: String::new(),
                        enabled: true,
                    })
                    .await?;
                info!(job_id = %job.id, "Created heartbeat job");
            }
            None => {}
        }

        let snapshot = {
            let mut config = self.config.write().unwrap();
            config.enabled = enabled;
            config.clone()
        };
        self.config_writer
            .write_section("heartbeat", serde_json::to_value(&snapshot)?)?;
        info!(enabled, "Heartbeat configuration updated");
        Ok(())
    }
}

/// One heartbeat run, start to finish.
async fn run_heartbeat(
    engine: &dyn ConversationEngine,
    resolver: &dyn DeliveryResolver,
    events: &EventLog,
    dedup: &Mutex<DedupState>,
    config: &HeartbeatConfig,
) {
    let started = Instant::now();

    if let Some(hours) = &config.active_hours {
        if !within_active_hours(hours, Utc::now()) {
            append_skip(events, "outside-active-hours");
            return;
        }
    }

    let raw = match engine
        .ask_with_session(&config.prompt, HEARTBEAT_SESSION, &AskOptions::default())
        .await
    {
        Ok(reply) => reply.text,
        Err(e) => {
            warn!("Heartbeat engine call failed: {e}");
            let payload = json!({
                "error": e.to_string(),
                "durationMs": started.elapsed().as_millis() as i64,
            });
            append_event(events, EVENT_HEARTBEAT_ERROR, payload);
            return;
        }
    };

    let parsed = parse_heartbeat_reply(&raw);
    match parsed.status {
        HeartbeatStatus::Ok => {
            append_skip(events, "ack");
            return;
        }
        HeartbeatStatus::ChatNo => {
            append_skip(events, "chat-no");
            return;
        }
        HeartbeatStatus::ChatYes => {}
    }
    let Some(content) = parsed.content else {
        append_skip(events, "empty");
        return;
    };

    let now_ms = Utc::now().timestamp_millis();
    if dedup.lock().unwrap().is_duplicate(&content, now_ms) {
        append_skip(events, "duplicate");
        return;
    }

    // The dedup entry is recorded on a delivery attempt, not on mere
    // eligibility: with no target registered the next run may try the
    // same message again.
    let mut delivered = false;
    match resolver.resolve() {
        Some(target) => {
            match target.deliver(&content).await {
                Ok(()) => delivered = true,
                Err(e) => warn!("Heartbeat delivery failed: {e}"),
            }
            dedup.lock().unwrap().record_attempt(&content, now_ms);
        }
        None => debug!("No delivery target for heartbeat message"),
    }

    let mut payload = json!({
        "text": content,
        "delivered": delivered,
        "durationMs": started.elapsed().as_millis() as i64,
    });
    if let Some(reason) = parsed.reason {
        payload["reason"] = json!(reason);
    }
    if parsed.unparsed {
        payload["unparsed"] = json!(true);
    }
    append_event(events, EVENT_HEARTBEAT_DONE, payload);
}

fn append_skip(events: &EventLog, reason: &str) {
    debug!(reason, "Heartbeat skipped");
    append_event(events, EVENT_HEARTBEAT_SKIP, json!({ "reason": reason }));
}

fn append_event(events: &EventLog, event_type: &str, payload: serde_json::Value) {
    if let Err(e) = events.append(event_type, payload) {
        warn!("Failed to record {event_type} event: {e}");
    }
}
