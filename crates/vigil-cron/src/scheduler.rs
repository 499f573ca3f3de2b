//! Cron scheduler: a single control loop owning all job state.
//!
//! Mutation (CRUD, run-now, timer ticks) is serialized through one
//! command queue, so due jobs are never processed concurrently with a
//! mutation and no lock guards the job table. The loop arms one timer
//! for the earliest enabled next-run, clamped to 60 seconds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_events::EventLog;

use crate::store::CronStore;
use crate::{
    CronError, CronFire, CronJob, CronJobState, EVENT_CRON_FIRE, JobCreate, JobPatch, Result,
    RunStatus, Schedule, backoff_delay_ms, next_run_at_ms,
};

/// Timer delay cap; bounds clock-drift error from very long waits.
const MAX_TIMER_DELAY_MS: i64 = 60_000;

/// Point-in-time scheduler summary.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub jobs: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_wake_at_ms: Option<i64>,
}

enum SchedulerCommand {
    Add {
        create: JobCreate,
        reply: oneshot::Sender<Result<CronJob>>,
    },
    Update {
        id: String,
        patch: JobPatch,
        reply: oneshot::Sender<Result<CronJob>>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    List {
        reply: oneshot::Sender<Vec<CronJob>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Result<CronJob>>,
    },
    RunNow {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<SchedulerStatus>,
    },
}

/// Handle to the scheduler loop. Cheap to clone; every method sends a
/// command into the loop and awaits its reply.
#[derive(Clone)]
pub struct CronScheduler {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl CronScheduler {
    /// Load persisted jobs from `store` and spawn the scheduler loop.
    ///
    /// The loop serves CRUD immediately; the timer stays disarmed until
    /// [`CronScheduler::start`]. Cancelling `shutdown` ends the loop.
    pub fn spawn(
        store: CronStore,
        events: Arc<EventLog>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let jobs = store.load()?;
        let (tx, rx) = mpsc::channel(32);
        let mut scheduler = SchedulerLoop::new(store, events, jobs, rx, shutdown);
        tokio::spawn(async move { scheduler.run().await });
        Ok(Self { tx })
    }

    /// Create a job. Its first next-run is resolved immediately.
    pub async fn add(&self, create: JobCreate) -> Result<CronJob> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::Add { create, reply }, rx).await?
    }

    /// Patch a job. Changing the schedule re-resolves its next run.
    pub async fn update(&self, id: &str, patch: JobPatch) -> Result<CronJob> {
        let (reply, rx) = oneshot::channel();
        let cmd = SchedulerCommand::Update {
            id: id.to_string(),
            patch,
            reply,
        };
        self.send(cmd, rx).await?
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let cmd = SchedulerCommand::Remove {
            id: id.to_string(),
            reply,
        };
        self.send(cmd, rx).await?
    }

    /// All jobs, in insertion order.
    pub async fn list(&self) -> Result<Vec<CronJob>> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::List { reply }, rx).await
    }

    pub async fn get(&self, id: &str) -> Result<CronJob> {
        let (reply, rx) = oneshot::channel();
        let cmd = SchedulerCommand::Get {
            id: id.to_string(),
            reply,
        };
        self.send(cmd, rx).await?
    }

    /// Fire a job immediately, independent of its schedule and enabled
    /// flag. A one-shot job is spent afterwards.
    pub async fn run_now(&self, id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let cmd = SchedulerCommand::RunNow {
            id: id.to_string(),
            reply,
        };
        self.send(cmd, rx).await?
    }

    /// Re-resolve stale next-runs from the current time and arm the
    /// timer, so an outage does not trigger a storm of overdue fires.
    pub async fn start(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::Start { reply }, rx).await?
    }

    /// De-arm the timer. The loop keeps serving CRUD; `start()` re-arms.
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::Stop { reply }, rx).await
    }

    pub async fn status(&self) -> Result<SchedulerStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::Status { reply }, rx).await
    }

    async fn send<T>(&self, cmd: SchedulerCommand, rx: oneshot::Receiver<T>) -> Result<T> {
        self.tx.send(cmd).await.map_err(|_| CronError::Closed)?;
        rx.await.map_err(|_| CronError::Closed)
    }
}

/// Loop state: the ordered id list plus an id-indexed map, the store,
/// and the log that receives fire events.
struct SchedulerLoop {
    store: CronStore,
    events: Arc<EventLog>,
    jobs: HashMap<String, CronJob>,
    order: Vec<String>,
    running: bool,
    commands: mpsc::Receiver<SchedulerCommand>,
    shutdown: CancellationToken,
}

impl SchedulerLoop {
    fn new(
        store: CronStore,
        events: Arc<EventLog>,
        loaded: Vec<CronJob>,
        commands: mpsc::Receiver<SchedulerCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        let mut jobs = HashMap::new();
        let mut order = Vec::new();
        for job in loaded {
            order.push(job.id.clone());
            jobs.insert(job.id.clone(), job);
        }
        Self {
            store,
            events,
            jobs,
            order,
            running: false,
            commands,
            shutdown,
        }
    }

    async fn run(&mut self) {
        info!(jobs = self.order.len(), "Cron scheduler loop started");
        loop {
            let sleep_for = self.time_until_next_due();
            tokio::select! {
                _ = tokio::time::sleep(sleep_for), if self.running => {
                    self.tick();
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        // All handles dropped
                        None => break,
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
        info!("Cron scheduler loop stopped");
    }

    fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::Add { create, reply } => {
                let _ = reply.send(self.add_job(create));
            }
            SchedulerCommand::Update { id, patch, reply } => {
                let _ = reply.send(self.update_job(&id, patch));
            }
            SchedulerCommand::Remove { id, reply } => {
                let _ = reply.send(self.remove_job(&id));
            }
            SchedulerCommand::List { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SchedulerCommand::Get { id, reply } => {
                let _ = reply.send(self.get_job(&id));
            }
            SchedulerCommand::RunNow { id, reply } => {
                let _ = reply.send(self.run_now(&id));
            }
            SchedulerCommand::Start { reply } => {
                let _ = reply.send(self.start());
            }
            SchedulerCommand::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            SchedulerCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn add_job(&mut self, create: JobCreate) -> Result<CronJob> {
        let now = now_ms();
        let mut job = CronJob {
            id: Uuid::new_v4().to_string(),
            name: create.name,
            schedule: create.schedule,
            payload: create.payload,
            enabled: create.enabled,
            state: CronJobState::default(),
            created_at: now,
        };
        resolve_next_run(&mut job, now);
        self.order.push(job.id.clone());
        self.jobs.insert(job.id.clone(), job.clone());
        self.persist()?;
        info!(job_id = %job.id, job_name = %job.name, "Added cron job");
        Ok(job)
    }

    fn update_job(&mut self, id: &str, patch: JobPatch) -> Result<CronJob> {
        let Some(job) = self.jobs.get_mut(id) else {
            return Err(CronError::NotFound(id.to_string()));
        };
        if let Some(name) = patch.name {
            job.name = name;
        }
        if let Some(payload) = patch.payload {
            job.payload = payload;
        }
        if let Some(enabled) = patch.enabled {
            job.enabled = enabled;
        }
        if let Some(schedule) = patch.schedule {
            job.schedule = schedule;
            resolve_next_run(job, now_ms());
        }
        let updated = job.clone();
        self.persist()?;
        info!(job_id = %id, "Updated cron job");
        Ok(updated)
    }

    fn remove_job(&mut self, id: &str) -> Result<()> {
        if self.jobs.remove(id).is_none() {
            return Err(CronError::NotFound(id.to_string()));
        }
        self.order.retain(|j| j != id);
        self.persist()?;
        info!(job_id = %id, "Removed cron job");
        Ok(())
    }

    fn get_job(&self, id: &str) -> Result<CronJob> {
        self.jobs
            .get(id)
            .cloned()
            .ok_or_else(|| CronError::NotFound(id.to_string()))
    }

    fn run_now(&mut self, id: &str) -> Result<()> {
        if !self.jobs.contains_key(id) {
            return Err(CronError::NotFound(id.to_string()));
        }
        self.fire(id);
        self.persist()
    }

    fn start(&mut self) -> Result<()> {
        let now = now_ms();
        for id in &self.order {
            if let Some(job) = self.jobs.get_mut(id) {
                let stale = job.state.next_run_at_ms.is_none_or(|next| next <= now);
                if stale {
                    resolve_next_run(job, now);
                }
            }
        }
        self.persist()?;
        self.running = true;
        info!(jobs = self.order.len(), "Cron scheduler started");
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
        info!("Cron scheduler stopped");
    }

    fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.running,
            jobs: self.order.len(),
            next_wake_at_ms: self.next_wake_at_ms(),
        }
    }

    /// Process every currently-due job in one pass, in insertion order,
    /// then persist once.
    fn tick(&mut self) {
        let now = now_ms();
        let mut due = Vec::new();
        for id in &self.order {
            let Some(job) = self.jobs.get(id) else {
                continue;
            };
            if job.enabled && job.state.next_run_at_ms.is_some_and(|next| next <= now) {
                due.push(id.clone());
            }
        }
        if due.is_empty() {
            return;
        }
        debug!(due = due.len(), "Cron tick");
        for id in &due {
            self.fire(id);
        }
        if let Err(e) = self.persist() {
            warn!("Failed to persist cron state after tick: {e}");
        }
    }

    /// Append one `cron.fire` event and apply the post-fire transition:
    /// status bookkeeping, then next-run resolution with escalating
    /// backoff after failures. One-shot jobs are spent here.
    fn fire(&mut self, id: &str) {
        let events = self.events.clone();
        let Some(job) = self.jobs.get_mut(id) else {
            return;
        };
        info!(job_id = %job.id, job_name = %job.name, "Firing cron job");
        let fire = CronFire {
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            payload: job.payload.clone(),
        };
        let now = now_ms();
        let appended = serde_json::to_value(&fire)
            .map_err(CronError::from)
            .and_then(|payload| {
                events
                    .append(EVENT_CRON_FIRE, payload)
                    .map_err(CronError::from)
            })
            .map(|_| ());
        apply_fire_outcome(job, appended, now);
    }

    fn time_until_next_due(&self) -> Duration {
        let now = now_ms();
        let mut delay_ms = MAX_TIMER_DELAY_MS;
        for job in self.order.iter().filter_map(|id| self.jobs.get(id)) {
            if !job.enabled {
                continue;
            }
            if let Some(next) = job.state.next_run_at_ms {
                delay_ms = delay_ms.min(next - now);
            }
        }
        Duration::from_millis(delay_ms.max(0) as u64)
    }

    fn next_wake_at_ms(&self) -> Option<i64> {
        self.order
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .filter(|job| job.enabled)
            .filter_map(|job| job.state.next_run_at_ms)
            .min()
    }

    fn snapshot(&self) -> Vec<CronJob> {
        self.order
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .cloned()
            .collect()
    }

    fn persist(&self) -> Result<()> {
        self.store.save(&self.snapshot())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Resolve a job's next run from its schedule. A one-shot whose moment
/// has passed, or whose timestamp cannot be parsed, is spent and
/// disables itself.
fn resolve_next_run(job: &mut CronJob, after_ms: i64) {
    job.state.next_run_at_ms = next_run_at_ms(&job.schedule, after_ms);
    if job.state.next_run_at_ms.is_none() && matches!(job.schedule, Schedule::At { .. }) {
        job.enabled = false;
    }
}

/// Post-fire state transition. Status and error count follow the append
/// outcome; a failed fire re-arms with escalating backoff instead of
/// the schedule.
fn apply_fire_outcome(job: &mut CronJob, appended: Result<()>, now: i64) {
    job.state.last_run_at_ms = Some(now);
    match appended {
        Ok(()) => {
            job.state.last_status = Some(RunStatus::Ok);
            job.state.consecutive_errors = 0;
        }
        Err(e) => {
            warn!(job_id = %job.id, "Failed to append fire event: {e}");
            job.state.last_status = Some(RunStatus::Error);
            job.state.consecutive_errors += 1;
        }
    }
    if matches!(job.schedule, Schedule::At { .. }) {
        // A fired one-shot is spent regardless of outcome.
        job.enabled = false;
        job.state.next_run_at_ms = None;
    } else if job.state.consecutive_errors > 0 {
        job.state.next_run_at_ms = Some(now + backoff_delay_ms(job.state.consecutive_errors));
    } else {
        job.state.next_run_at_ms = next_run_at_ms(&job.schedule, now);
    }
}
