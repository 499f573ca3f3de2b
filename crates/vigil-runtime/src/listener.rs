//! Generic job listener: forwards fire events to the engine.
//!
//! Listens for `cron.fire`, asks the engine with the job's payload in
//! a per-job session, then delivers the reply through the last-active
//! channel. Fires for job names claimed by a specialized consumer
//! (the heartbeat) are left alone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::json;
use tracing::{debug, warn};

use vigil_cron::{CronFire, EVENT_CRON_FIRE};
use vigil_events::{EventLog, Subscription};
use vigil_types::AskOptions;

use crate::channels::DeliveryResolver;
use crate::engine::ConversationEngine;

/// Appended after a job's engine call completed.
pub const EVENT_CRON_DONE: &str = "cron.done";
/// Appended after a job's engine call failed.
pub const EVENT_CRON_ERROR: &str = "cron.error";

/// Consumes fire events for ordinary scheduled jobs.
///
/// One invocation runs at a time; a fire that arrives while the
/// previous one is still in flight is dropped.
pub struct JobListener {
    events: Arc<EventLog>,
    engine: Arc<dyn ConversationEngine>,
    resolver: Arc<dyn DeliveryResolver>,
    /// Job names handled elsewhere and skipped here.
    claimed: Vec<String>,
    busy: Arc<AtomicBool>,
    subscription: Mutex<Option<Subscription>>,
}

impl JobListener {
    pub fn new(
        events: Arc<EventLog>,
        engine: Arc<dyn ConversationEngine>,
        resolver: Arc<dyn DeliveryResolver>,
        claimed: Vec<String>,
    ) -> Self {
        Self {
            events,
            engine,
            resolver,
            claimed,
            busy: Arc::new(AtomicBool::new(false)),
            subscription: Mutex::new(None),
        }
    }

    /// Subscribe to fire events. Idempotent; must be called from
    /// within a Tokio runtime.
    pub fn start(&self) {
        let mut guard = self.subscription.lock().unwrap();
        if guard.is_some() {
            return;
        }

        let events = self.events.clone();
        let engine = self.engine.clone();
        let resolver = self.resolver.clone();
        let claimed = self.claimed.clone();
        let busy = self.busy.clone();

        let sub = self.events.subscribe_type(
            EVENT_CRON_FIRE,
            Arc::new(move |entry| {
                let fire: CronFire = serde_json::from_value(entry.payload.clone())?;
                if claimed.iter().any(|name| *name == fire.job_name) {
                    return Ok(());
                }
                if busy
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    debug!(job_name = %fire.job_name, "Job listener busy, dropping fire event");
                    return Ok(());
                }
                let events = events.clone();
                let engine = engine.clone();
                let resolver = resolver.clone();
                let busy = busy.clone();
                tokio::spawn(async move {
                    process_fire(&*engine, &*resolver, &events, fire).await;
                    busy.store(false, Ordering::SeqCst);
                });
                Ok(())
            }),
        );
        *guard = Some(sub);
    }

    /// Unsubscribe. An in-flight invocation is allowed to finish.
    pub fn stop(&self) {
        if let Some(sub) = self.subscription.lock().unwrap().take() {
            sub.cancel();
        }
    }
}

async fn process_fire(
    engine: &dyn ConversationEngine,
    resolver: &dyn DeliveryResolver,
    events: &EventLog,
    fire: CronFire,
) {
    let started = Instant::now();
    let session = format!("cron:{}", fire.job_id);

    match engine
        .ask_with_session(&fire.payload, &session, &AskOptions::default())
        .await
    {
        Ok(reply) => {
            match resolver.resolve() {
                Some(target) => {
                    if let Err(e) = target.deliver(&reply.text).await {
                        warn!(job_id = %fire.job_id, "Failed to deliver job reply: {e}");
                    }
                }
                None => debug!(job_id = %fire.job_id, "No delivery target for job reply"),
            }
            let payload = json!({
                "jobId": fire.job_id,
                "jobName": fire.job_name,
                "reply": reply.text,
                "durationMs": started.elapsed().as_millis() as i64,
            });
            if let Err(e) = events.append(EVENT_CRON_DONE, payload) {
                warn!(job_id = %fire.job_id, "Failed to record job completion: {e}");
            }
        }
        Err(e) => {
            warn!(job_id = %fire.job_id, "Engine call for job failed: {e}");
            let payload = json!({
                "jobId": fire.job_id,
                "jobName": fire.job_name,
                "error": e.to_string(),
                "durationMs": started.elapsed().as_millis() as i64,
            });
            if let Err(e) = events.append(EVENT_CRON_ERROR, payload) {
                warn!(job_id = %fire.job_id, "Failed to record job failure: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelRegistry, DeliveryTarget};
    use std::time::Duration;
    use tempfile::TempDir;
    use vigil_events::EventQuery;
    use vigil_types::EngineReply;

    struct MockEngine {
        calls: Mutex<Vec<(String, String)>>,
        fail: bool,
        delay: Duration,
    }

    impl MockEngine {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: false,
                delay: Duration::ZERO,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new()
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl ConversationEngine for MockEngine {
        async fn ask_with_session(
            &self,
            prompt: &str,
            session: &str,
            _options: &AskOptions,
        ) -> anyhow::Result<EngineReply> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.calls
                .lock()
                .unwrap()
                .push((prompt.to_string(), session.to_string()));
            if self.fail {
                anyhow::bail!("engine offline");
            }
            Ok(EngineReply::text(format!("reply to: {prompt}")))
        }

        async fn ask(&self, prompt: &str) -> anyhow::Result<EngineReply> {
            self.ask_with_session(prompt, "", &AskOptions::default())
                .await
        }
    }

    struct MockTarget {
        delivered: Mutex<Vec<String>>,
        fail: bool,
    }

    impl MockTarget {
        fn new() -> Self {
            Self {
                delivered: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl DeliveryTarget for MockTarget {
        fn channel_id(&self) -> &str {
            "mock"
        }

        async fn deliver(&self, text: &str) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("channel down");
            }
            self.delivered.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct Harness {
        _dir: TempDir,
        events: Arc<EventLog>,
        engine: Arc<MockEngine>,
        target: Arc<MockTarget>,
        listener: JobListener,
    }

    fn harness(engine: MockEngine, target: MockTarget) -> Harness {
        let dir = TempDir::new().unwrap();
        let events = Arc::new(EventLog::open(dir.path().join("events.jsonl")).unwrap());
        let engine = Arc::new(engine);
        let target = Arc::new(target);
        let registry = Arc::new(ChannelRegistry::new());
        registry.register(target.clone() as Arc<dyn DeliveryTarget>);
        let listener = JobListener::new(
            events.clone(),
            engine.clone(),
            registry,
            vec!["heartbeat".to_string()],
        );
        Harness {
            _dir: dir,
            events,
            engine,
            target,
            listener,
        }
    }

    fn fire(events: &EventLog, job_name: &str, payload: &str) {
        let fire = CronFire {
            job_id: format!("{job_name}-id"),
            job_name: job_name.to_string(),
            payload: payload.to_string(),
        };
        events
            .append(EVENT_CRON_FIRE, serde_json::to_value(&fire).unwrap())
            .unwrap();
    }

    fn events_of(events: &EventLog, event_type: &str) -> Vec<vigil_events::EventEntry> {
        events.read(&EventQuery::of_type(event_type)).unwrap()
    }

    #[tokio::test]
    async fn test_fire_asks_engine_and_delivers_reply() {
        let h = harness(MockEngine::new(), MockTarget::new());
        h.listener.start();

        fire(&h.events, "digest", "summarize the day");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let calls = h.engine.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "summarize the day");
        assert_eq!(calls[0].1, "cron:digest-id");

        let delivered = h.target.delivered.lock().unwrap().clone();
        assert_eq!(delivered, vec!["reply to: summarize the day"]);

        let done = events_of(&h.events, EVENT_CRON_DONE);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].payload["jobId"], "digest-id");
        assert_eq!(done[0].payload["jobName"], "digest");
        assert_eq!(done[0].payload["reply"], "reply to: summarize the day");
        assert!(done[0].payload["durationMs"].is_i64());
    }

    #[tokio::test]
    async fn test_engine_failure_records_error_event() {
        let h = harness(MockEngine::failing(), MockTarget::new());
        h.listener.start();

        fire(&h.events, "digest", "hello");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(h.target.delivered.lock().unwrap().is_empty());
        assert!(events_of(&h.events, EVENT_CRON_DONE).is_empty());

        let errors = events_of(&h.events, EVENT_CRON_ERROR);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload["jobName"], "digest");
        assert_eq!(errors[0].payload["error"], "engine offline");
    }

    #[tokio::test]
    async fn test_claimed_job_name_is_ignored() {
        let h = harness(MockEngine::new(), MockTarget::new());
        h.listener.start();

        fire(&h.events, "heartbeat", "");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.engine.call_count(), 0);
        assert!(events_of(&h.events, EVENT_CRON_DONE).is_empty());
    }

    #[tokio::test]
    async fn test_busy_listener_drops_second_fire() {
        let h = harness(
            MockEngine::slow(Duration::from_millis(150)),
            MockTarget::new(),
        );
        h.listener.start();

        fire(&h.events, "digest", "first");
        fire(&h.events, "digest", "second");
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(h.engine.call_count(), 1);
        assert_eq!(events_of(&h.events, EVENT_CRON_DONE).len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_still_records_done() {
        let h = harness(
            MockEngine::new(),
            MockTarget {
                fail: true,
                ..MockTarget::new()
            },
        );
        h.listener.start();

        fire(&h.events, "digest", "hello");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let done = events_of(&h.events, EVENT_CRON_DONE);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].payload["reply"], "reply to: hello");
    }

    #[tokio::test]
    async fn test_missing_delivery_target_still_records_done() {
        let dir = TempDir::new().unwrap();
        let events = Arc::new(EventLog::open(dir.path().join("events.jsonl")).unwrap());
        let engine = Arc::new(MockEngine::new());
        let listener = JobListener::new(
            events.clone(),
            engine.clone(),
            Arc::new(ChannelRegistry::new()),
            Vec::new(),
        );
        listener.start();

        fire(&events, "digest", "hello");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(engine.call_count(), 1);
        assert_eq!(events_of(&events, EVENT_CRON_DONE).len(), 1);
    }

    #[tokio::test]
    async fn test_stop_unsubscribes() {
        let h = harness(MockEngine::new(), MockTarget::new());
        h.listener.start();
        h.listener.stop();

        fire(&h.events, "digest", "hello");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.engine.call_count(), 0);
    }
}
