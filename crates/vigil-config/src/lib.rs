use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use vigil_types::ActiveHours;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Invalid config: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("Home directory not found")]
    NoDirFound,
}

// ──────────────────── Sections ────────────────────

/// Heartbeat configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Whether the heartbeat job is active.
    #[serde(default)]
    pub enabled: bool,
    /// Interval between heartbeats, compact duration (e.g. "30m", "1h30m").
    #[serde(default = "default_heartbeat_every")]
    pub every: String,
    /// Prompt sent to the conversation engine on every heartbeat.
    #[serde(default = "default_heartbeat_prompt")]
    pub prompt: String,
    /// Local time-of-day window outside of which heartbeats are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_hours: Option<ActiveHours>,
}

fn default_heartbeat_every() -> String {
    "30m".to_string()
}

fn default_heartbeat_prompt() -> String {
    DEFAULT_HEARTBEAT_PROMPT.to_string()
}

/// Built-in heartbeat prompt instructing the structured reply protocol.
pub const DEFAULT_HEARTBEAT_PROMPT: &str = "\
You are performing a periodic self-check. Review your pending tasks and \
anything that may need the user's attention, then reply in exactly this \
format:\n\
STATUS: HEARTBEAT_OK | CHAT_YES | CHAT_NO\n\
REASON: <one line>\n\
CONTENT: <the message to send the user; only when STATUS is CHAT_YES>\n\
Reply with STATUS: HEARTBEAT_OK when nothing needs attention.";

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            every: default_heartbeat_every(),
            prompt: default_heartbeat_prompt(),
            active_hours: None,
        }
    }
}

/// Conversation engine endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// URL the engine client posts prompts to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_engine_timeout")]
    pub timeout_secs: u64,
}

fn default_engine_timeout() -> u64 {
    120
}

/// Outbound delivery settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Webhook URL that receives `{ "text": ... }` deliveries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// Event log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Event log file path (defaults to `<state>/events.jsonl`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// In-memory buffer capacity for `recent()` queries.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_buffer_size() -> usize {
    500
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            path: None,
            buffer_size: default_buffer_size(),
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronConfig {
    /// Job store path (defaults to `<state>/cron/jobs.json`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
}

// ──────────────────── Top Level ────────────────────

/// Top-level vigil configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    /// Heartbeat section.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Conversation engine endpoint.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Outbound delivery settings.
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Event log settings.
    #[serde(default)]
    pub events: EventsConfig,
    /// Scheduler settings.
    #[serde(default)]
    pub cron: CronConfig,
}

impl VigilConfig {
    /// Resolve the event log file path.
    pub fn events_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.events.path {
            Some(p) => Ok(p.clone()),
            None => Ok(state_dir()?.join("events.jsonl")),
        }
    }

    /// Resolve the job store file path.
    pub fn jobs_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.cron.store_path {
            Some(p) => Ok(p.clone()),
            None => Ok(state_dir()?.join("cron").join("jobs.json")),
        }
    }
}

// ──────────────────── Paths ────────────────────

/// Resolve the vigil state directory (~/.vigil/), honoring `VIGIL_STATE_DIR`.
pub fn state_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(dir) = std::env::var("VIGIL_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|h| h.join(".vigil"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.vigil/config.json5), honoring
/// `VIGIL_CONFIG_PATH`.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var("VIGIL_CONFIG_PATH") {
        return Ok(PathBuf::from(path));
    }
    Ok(state_dir()?.join("config.json5"))
}

/// Ensure the state directory exists.
pub fn ensure_state_dir() -> Result<PathBuf, ConfigError> {
    let dir = state_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

// ──────────────────── Load / Save ────────────────────

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<VigilConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<VigilConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(VigilConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: VigilConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Save configuration to the default path.
pub fn save_config(config: &VigilConfig) -> Result<(), ConfigError> {
    ensure_state_dir()?;
    save_config_to(&config_file_path()?, config)
}

/// Save configuration to a specific path.
pub fn save_config_to(path: &Path, config: &VigilConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

// ──────────────────── Section Writer ────────────────────

/// Replace one top-level config section and persist the result.
///
/// The merged document is validated as a whole before anything is written,
/// so a bad section value can never corrupt the stored config. Returns the
/// validated configuration.
pub fn write_config_section(
    name: &str,
    value: serde_json::Value,
) -> Result<VigilConfig, ConfigError> {
    ensure_state_dir()?;
    write_config_section_at(&config_file_path()?, name, value)
}

/// Like [`write_config_section`] against an explicit file path.
pub fn write_config_section_at(
    path: &Path,
    name: &str,
    value: serde_json::Value,
) -> Result<VigilConfig, ConfigError> {
    let root = if path.exists() {
        json5::from_str::<serde_json::Value>(&std::fs::read_to_string(path)?)?
    } else {
        serde_json::Value::Object(serde_json::Map::new())
    };

    let (root, config) = apply_section(root, name, value)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&root)?)?;
    Ok(config)
}

/// Set `root[name] = value` and validate the merged document.
fn apply_section(
    root: serde_json::Value,
    name: &str,
    value: serde_json::Value,
) -> Result<(serde_json::Value, VigilConfig), ConfigError> {
    let mut map = match root {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    map.insert(name.to_string(), value);
    let root = serde_json::Value::Object(map);

    let config: VigilConfig = serde_json::from_value(root.clone())?;
    Ok((root, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VigilConfig::default();
        assert!(!config.heartbeat.enabled);
        assert_eq!(config.heartbeat.every, "30m");
        assert_eq!(config.events.buffer_size, 500);
        assert!(config.engine.url.is_none());
    }

    #[test]
    fn test_json5_parse() {
        let json5_str = r#"{
            heartbeat: {
                enabled: true,
                every: "1h",
                active_hours: { start: "08:00", end: "22:00", timezone: "Europe/Berlin" },
            },
            engine: { url: "http://127.0.0.1:3000/ask" },
        }"#;
        let config: VigilConfig = json5::from_str(json5_str).unwrap();
        assert!(config.heartbeat.enabled);
        assert_eq!(config.heartbeat.every, "1h");
        let hours = config.heartbeat.active_hours.unwrap();
        assert_eq!(hours.start, "08:00");
        assert_eq!(config.engine.url.as_deref(), Some("http://127.0.0.1:3000/ask"));
        // Unset sections keep their defaults
        assert_eq!(config.events.buffer_size, 500);
        assert!(!config.heartbeat.prompt.is_empty());
    }

    #[test]
    fn test_apply_section_validates() {
        let root = serde_json::json!({ "engine": { "url": "http://x" } });
        let section = serde_json::json!({ "enabled": true, "every": "15m" });
        let (merged, config) = apply_section(root, "heartbeat", section).unwrap();
        assert!(config.heartbeat.enabled);
        assert_eq!(config.heartbeat.every, "15m");
        // Existing sections survive the merge
        assert_eq!(merged["engine"]["url"], "http://x");

        // A structurally-invalid section is rejected before any write
        let bad = apply_section(
            serde_json::json!({}),
            "heartbeat",
            serde_json::json!({ "enabled": "definitely" }),
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_write_config_section_at_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json5");

        let section = serde_json::json!({ "enabled": true, "every": "45m" });
        let config = write_config_section_at(&path, "heartbeat", section).unwrap();
        assert!(config.heartbeat.enabled);

        let reloaded = load_config_from(&path).unwrap();
        assert!(reloaded.heartbeat.enabled);
        assert_eq!(reloaded.heartbeat.every, "45m");

        // Second write replaces the section without touching the rest
        write_config_section_at(&path, "engine", serde_json::json!({ "url": "http://e" }))
            .unwrap();
        let reloaded = load_config_from(&path).unwrap();
        assert!(reloaded.heartbeat.enabled);
        assert_eq!(reloaded.engine.url.as_deref(), Some("http://e"));
    }

    #[test]
    fn test_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.json5")).unwrap();
        assert!(!config.heartbeat.enabled);
    }
}
