use serde::{Deserialize, Serialize};

// ──────────────────── Engine Types ────────────────────

/// Reply returned by the conversation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineReply {
    /// Response text content.
    pub text: String,
    /// Media references (file paths or URLs) produced alongside the text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
}

impl EngineReply {
    /// Text-only reply.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media: Vec::new(),
        }
    }
}

/// Options for a single engine call.
///
/// The scheduling core imposes no timeout of its own; a caller-supplied
/// timeout here is the expected mechanism.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AskOptions {
    /// Maximum time the engine may take, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

// ──────────────────── Active Hours ────────────────────

/// A local time-of-day window during which a periodic check is allowed
/// to run. `start > end` wraps overnight (e.g. 22:00–07:00).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveHours {
    /// Window start, "HH:MM".
    pub start: String,
    /// Window end, "HH:MM" (exclusive).
    pub end: String,
    /// IANA timezone name (e.g. "Europe/Berlin"). Host-local when absent
    /// or unresolvable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

// ──────────────────── Channel Types ────────────────────

/// Summary information about a registered delivery channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Unique channel instance ID.
    pub channel_id: String,
    /// When the channel last saw user activity (unix millis).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<i64>,
}
