//! vigil-events: durable append-only event log.
//!
//! Every occurrence in the system (job fires, listener results, heartbeat
//! outcomes) is appended here as one JSON line with a strictly increasing
//! sequence number. A bounded in-memory buffer serves low-latency
//! `recent()` queries, and subscribers receive every append in
//! registration order.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Default capacity of the in-memory recent-events buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EventLogError>;

/// A single committed log entry. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    /// Strictly increasing sequence number, 1-based.
    pub seq: u64,
    /// Creation timestamp (unix millis).
    pub ts: i64,
    /// Short routing tag (e.g. "cron.fire").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque structured value.
    pub payload: serde_json::Value,
}

/// Filter for `read()` and `recent()`.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Only entries with `seq` strictly greater than this.
    pub after_seq: u64,
    /// Only entries of this type, when set.
    pub event_type: Option<String>,
    /// Stop after this many results, when set.
    pub limit: Option<usize>,
}

impl EventQuery {
    /// Query for a single event type.
    pub fn of_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            ..Self::default()
        }
    }

    fn matches(&self, entry: &EventEntry) -> bool {
        entry.seq > self.after_seq
            && self
                .event_type
                .as_deref()
                .is_none_or(|t| t == entry.event_type)
    }
}

/// Subscriber callback. Returned errors are logged and swallowed so one
/// faulty subscriber cannot break fan-out or the caller's append.
pub type EventListener = Arc<dyn Fn(&EventEntry) -> anyhow::Result<()> + Send + Sync>;

struct Subscriber {
    id: u64,
    /// None subscribes to every type.
    event_type: Option<String>,
    listener: EventListener,
}

/// Handle returned by `subscribe`/`subscribe_type`. Call [`Subscription::cancel`]
/// to detach the listener; dropping the handle leaves it attached.
pub struct Subscription {
    id: u64,
    subscribers: Weak<RwLock<Vec<Subscriber>>>,
}

impl Subscription {
    /// Remove the associated listener from the log.
    pub fn cancel(self) {
        if let Some(subs) = self.subscribers.upgrade() {
            subs.write().unwrap().retain(|s| s.id != self.id);
        }
    }
}

struct LogState {
    /// High-water mark; advanced only after a successful durable write.
    seq: u64,
    file: File,
    buffer: VecDeque<EventEntry>,
}

/// Durable, ordered, append-only event log.
pub struct EventLog {
    path: PathBuf,
    buffer_size: usize,
    state: Mutex<LogState>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    next_sub_id: AtomicU64,
}

impl EventLog {
    /// Open (or create) a log at `path` with the default buffer size.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with(path, DEFAULT_BUFFER_SIZE)
    }

    /// Open (or create) a log, recovering sequence counter and recent
    /// buffer from the existing file.
    ///
    /// All well-formed lines are parsed; the counter resumes at the last
    /// entry's `seq`, and the final `buffer_size` entries pre-populate the
    /// buffer, so appends continue with no gaps and `recent()` reflects
    /// pre-crash history immediately.
    pub fn open_with(path: impl Into<PathBuf>, buffer_size: usize) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut seq = 0u64;
        let mut buffer = VecDeque::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                // Malformed lines are skipped, never fatal
                let Ok(entry) = serde_json::from_str::<EventEntry>(&line) else {
                    continue;
                };
                seq = seq.max(entry.seq);
                push_bounded(&mut buffer, entry, buffer_size);
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            buffer_size,
            state: Mutex::new(LogState { seq, file, buffer }),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_sub_id: AtomicU64::new(1),
        })
    }

    /// File backing this log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event: durable write first, then the in-memory buffer,
    /// then subscriber fan-out in registration order.
    ///
    /// A durable-write failure propagates and the entry is not committed
    /// (the sequence counter does not advance). Listener errors are logged
    /// and swallowed.
    pub fn append(&self, event_type: &str, payload: serde_json::Value) -> Result<EventEntry> {
        let entry = {
            let mut state = self.state.lock().unwrap();
            let entry = EventEntry {
                seq: state.seq + 1,
                ts: chrono::Utc::now().timestamp_millis(),
                event_type: event_type.to_string(),
                payload,
            };
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            state.file.write_all(line.as_bytes())?;
            state.seq = entry.seq;
            push_bounded(&mut state.buffer, entry.clone(), self.buffer_size);
            entry
        };

        // Snapshot matching listeners so callbacks can subscribe/unsubscribe
        // (or append) without deadlocking on the registry lock.
        let listeners: Vec<EventListener> = {
            let subs = self.subscribers.read().unwrap();
            subs.iter()
                .filter(|s| {
                    s.event_type
                        .as_deref()
                        .is_none_or(|t| t == entry.event_type)
                })
                .map(|s| s.listener.clone())
                .collect()
        };
        for listener in listeners {
            if let Err(e) = listener(&entry) {
                warn!(seq = entry.seq, event_type = %entry.event_type, "Event listener failed: {e}");
            }
        }

        Ok(entry)
    }

    /// Re-read durable storage, filtering by the query. Malformed lines
    /// are skipped; the scan stops once `limit` results are collected.
    pub fn read(&self, query: &EventQuery) -> Result<Vec<EventEntry>> {
        let mut out = Vec::new();
        if !self.path.exists() {
            return Ok(out);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(entry) = serde_json::from_str::<EventEntry>(&line) else {
                continue;
            };
            if !query.matches(&entry) {
                continue;
            }
            out.push(entry);
            if query.limit.is_some_and(|l| out.len() >= l) {
                break;
            }
        }
        Ok(out)
    }

    /// Same filtering as `read()` against the in-memory buffer only.
    /// Bounded visibility, no disk I/O.
    pub fn recent(&self, query: &EventQuery) -> Vec<EventEntry> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for entry in state.buffer.iter() {
            if !query.matches(entry) {
                continue;
            }
            out.push(entry.clone());
            if query.limit.is_some_and(|l| out.len() >= l) {
                break;
            }
        }
        out
    }

    /// Current high-water mark; 0 if the log is empty.
    pub fn last_seq(&self) -> u64 {
        self.state.lock().unwrap().seq
    }

    /// Subscribe to every append.
    pub fn subscribe(&self, listener: EventListener) -> Subscription {
        self.add_subscriber(None, listener)
    }

    /// Subscribe to appends of one event type.
    pub fn subscribe_type(&self, event_type: impl Into<String>, listener: EventListener) -> Subscription {
        self.add_subscriber(Some(event_type.into()), listener)
    }

    fn add_subscriber(&self, event_type: Option<String>, listener: EventListener) -> Subscription {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().unwrap().push(Subscriber {
            id,
            event_type,
            listener,
        });
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }

    /// In-process lifecycle end: detach all subscribers and clear the
    /// buffer. Durable storage is untouched.
    pub fn close(&self) {
        self.subscribers.write().unwrap().clear();
        self.state.lock().unwrap().buffer.clear();
    }
}

fn push_bounded(buffer: &mut VecDeque<EventEntry>, entry: EventEntry, capacity: usize) {
    if capacity == 0 {
        return;
    }
    if buffer.len() == capacity {
        buffer.pop_front();
    }
    buffer.push_back(entry);
}
