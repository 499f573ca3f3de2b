//! vigil-cron: job scheduling on top of the event log.
//!
//! Jobs carry a one-shot, repeating-interval, or cron-expression
//! schedule. A single timer drives all of them; when a job becomes due
//! the scheduler appends a `cron.fire` event to the log instead of
//! invoking work directly, and listeners take it from there.

pub mod scheduler;
pub mod store;

mod cron;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event type appended once per due job.
pub const EVENT_CRON_FIRE: &str = "cron.fire";

/// Escalating delays applied after consecutive fire failures, capped at
/// the last entry: 30s, 60s, 5m, 15m, 1h.
pub const ERROR_BACKOFF_MS: [i64; 5] = [30_000, 60_000, 300_000, 900_000, 3_600_000];

#[derive(Debug, Error)]
pub enum CronError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event log error: {0}")]
    EventLog(#[from] vigil_events::EventLogError),
    #[error("scheduler has shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, CronError>;

/// When a job should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Schedule {
    /// Once, at an absolute RFC 3339 timestamp.
    At { at: String },
    /// Repeatedly, at a compact-duration interval (e.g. "30m", "1h30m").
    Every { every: String },
    /// On a five-field cron expression (minute hour day month weekday).
    Cron { expr: String },
}

/// A scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    /// Unique job ID.
    pub id: String,
    /// Human label; listeners use it as a routing key.
    pub name: String,
    /// When to fire.
    pub schedule: Schedule,
    /// Opaque text handed to listeners on every fire.
    #[serde(default)]
    pub payload: String,
    /// Disabled jobs are never selected by the timer.
    pub enabled: bool,
    /// Mutable run bookkeeping.
    #[serde(default)]
    pub state: CronJobState,
    /// Creation time (unix millis).
    pub created_at: i64,
}

/// Run bookkeeping for one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobState {
    /// Null exactly when the job is a spent one-shot or its schedule
    /// cannot be parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default)]
    pub consecutive_errors: u32,
}

/// Outcome of the most recent fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
}

/// Fields for creating a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCreate {
    pub name: String,
    pub schedule: Schedule,
    #[serde(default)]
    pub payload: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Partial update; unset fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// Payload of a `cron.fire` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronFire {
    pub job_id: String,
    pub job_name: String,
    #[serde(default)]
    pub payload: String,
}

/// Resolve a schedule's next fire time strictly after `after_ms`.
///
/// One-shot timestamps already past, anything unparseable, and next
/// runs not representable in i64 millis all resolve to `None`.
pub fn next_run_at_ms(schedule: &Schedule, after_ms: i64) -> Option<i64> {
    match schedule {
        Schedule::At { at } => {
            let at_ms = DateTime::parse_from_rfc3339(at).ok()?.timestamp_millis();
            (at_ms > after_ms).then_some(at_ms)
        }
        Schedule::Every { every } => {
            let every_ms = parse_duration_ms(every)?;
            after_ms.checked_add(every_ms)
        }
        Schedule::Cron { expr } => {
            let expr = cron::parse_cron_expr(expr)?;
            let after = Utc.timestamp_millis_opt(after_ms).single()?;
            cron::next_cron_run(&expr, after).map(|next| next.timestamp_millis())
        }
    }
}

/// Parse a compact duration like "30m", "1h30m" or "2d" into millis.
/// Units: d, h, m, s. Empty input, unknown units, trailing bare digits,
/// zero totals and totals overflowing i64 millis are all unparseable.
pub fn parse_duration_ms(text: &str) -> Option<i64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let mut total_ms: i64 = 0;
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: i64 = digits.parse().ok()?;
        digits.clear();
        let unit_ms = match ch {
            'd' => 86_400_000,
            'h' => 3_600_000,
            'm' => 60_000,
            's' => 1_000,
            _ => return None,
        };
        total_ms = value
            .checked_mul(unit_ms)
            .and_then(|ms| total_ms.checked_add(ms))?;
    }
    if !digits.is_empty() || total_ms <= 0 {
        return None;
    }
    Some(total_ms)
}

/// Backoff delay for the n-th consecutive failure (1-based), capped at
/// the table's last entry.
pub fn backoff_delay_ms(consecutive_errors: u32) -> i64 {
    let index = (consecutive_errors.max(1) as usize - 1).min(ERROR_BACKOFF_MS.len() - 1);
    ERROR_BACKOFF_MS[index]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_duration_ms() {
        assert_eq!(parse_duration_ms("1h30m"), Some(5_400_000));
        assert_eq!(parse_duration_ms("30m"), Some(1_800_000));
        assert_eq!(parse_duration_ms("45s"), Some(45_000));
        assert_eq!(parse_duration_ms("2d"), Some(172_800_000));
        assert_eq!(parse_duration_ms("1d2h3m4s"), Some(93_784_000));
        assert_eq!(parse_duration_ms(""), None);
        assert_eq!(parse_duration_ms("abc"), None);
        assert_eq!(parse_duration_ms("90"), None);
        assert_eq!(parse_duration_ms("0s"), None);
    }

    #[test]
    fn test_parse_duration_overflow_is_unparseable() {
        assert_eq!(parse_duration_ms("100000000000000h"), None);
        assert_eq!(parse_duration_ms("9223372036854775807d"), None);
        // Overflow in the running total, not a single term
        assert_eq!(parse_duration_ms("9223372036854775s9223372036854775s"), None);
    }

    #[test]
    fn test_backoff_table_escalates_and_caps() {
        let delays: Vec<i64> = (1u32..=7).map(backoff_delay_ms).collect();
        assert_eq!(
            delays,
            vec![30_000, 60_000, 300_000, 900_000, 3_600_000, 3_600_000, 3_600_000]
        );
    }

    #[test]
    fn test_next_run_one_shot() {
        let schedule = Schedule::At {
            at: "2030-01-01T00:00:00Z".to_string(),
        };
        let next = next_run_at_ms(&schedule, 0).unwrap();
        assert_eq!(next, 1_893_456_000_000);

        // Already past
        assert_eq!(next_run_at_ms(&schedule, next + 1), None);

        let bad = Schedule::At {
            at: "tomorrow-ish".to_string(),
        };
        assert_eq!(next_run_at_ms(&bad, 0), None);
    }

    #[test]
    fn test_next_run_every() {
        let schedule = Schedule::Every {
            every: "30m".to_string(),
        };
        assert_eq!(next_run_at_ms(&schedule, 1_000_000), Some(2_800_000));

        let bad = Schedule::Every {
            every: "abc".to_string(),
        };
        assert_eq!(next_run_at_ms(&bad, 0), None);
    }

    #[test]
    fn test_next_run_every_overflow_resolves_none() {
        // Parses to just under i64::MAX millis, so the interval itself is
        // fine but adding it to any realistic reference time is not.
        let schedule = Schedule::Every {
            every: "9223372036854775s".to_string(),
        };
        assert_eq!(next_run_at_ms(&schedule, 0), Some(9_223_372_036_854_775_000));
        assert_eq!(next_run_at_ms(&schedule, 1_748_772_000_000), None);
    }

    #[test]
    fn test_next_run_cron() {
        // 2025-06-01T10:00:00Z
        let base_ms = 1_748_772_000_000;
        let schedule = Schedule::Cron {
            expr: "0 * * * *".to_string(),
        };
        assert_eq!(next_run_at_ms(&schedule, base_ms), Some(base_ms + 3_600_000));

        let bad = Schedule::Cron {
            expr: "not cron".to_string(),
        };
        assert_eq!(next_run_at_ms(&bad, base_ms), None);
    }

    #[test]
    fn test_schedule_serde_shape() {
        let schedule = Schedule::Cron {
            expr: "*/5 * * * *".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&schedule).unwrap(),
            json!({ "kind": "cron", "expr": "*/5 * * * *" })
        );

        let parsed: Schedule =
            serde_json::from_value(json!({ "kind": "every", "every": "1h" })).unwrap();
        assert_eq!(
            parsed,
            Schedule::Every {
                every: "1h".to_string()
            }
        );
    }

    #[test]
    fn test_job_serde_uses_camel_case() {
        let job = CronJob {
            id: "j1".to_string(),
            name: "check".to_string(),
            schedule: Schedule::At {
                at: "2030-01-01T00:00:00Z".to_string(),
            },
            payload: String::new(),
            enabled: true,
            state: CronJobState {
                next_run_at_ms: Some(1),
                ..CronJobState::default()
            },
            created_at: 0,
        };
        let value = serde_json::to_value(&job).unwrap();
        assert!(value.get("createdAt").is_some());
        let state = value.get("state").unwrap();
        assert!(state.get("nextRunAtMs").is_some());
        assert!(state.get("consecutiveErrors").is_some());
    }
}
