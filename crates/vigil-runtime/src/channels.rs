//! Delivery channels and the last-active registry.
//!
//! Unsolicited output (job replies, heartbeat messages) goes to
//! whichever channel most recently saw user activity. The registry is
//! an explicit value: construct one per process and hand it to every
//! component that needs to resolve a target.

use std::sync::{Arc, RwLock};

use vigil_types::ChannelInfo;

/// An outbound channel that can push text to the user.
#[async_trait::async_trait]
pub trait DeliveryTarget: Send + Sync {
    /// Stable identifier for this channel instance.
    fn channel_id(&self) -> &str;

    /// Push `text` out through the channel.
    async fn deliver(&self, text: &str) -> anyhow::Result<()>;
}

/// Picks the channel that should receive unsolicited output.
pub trait DeliveryResolver: Send + Sync {
    /// Most-recently-active registered channel, or `None` when no
    /// channel is registered at all.
    fn resolve(&self) -> Option<Arc<dyn DeliveryTarget>>;
}

struct RegisteredChannel {
    target: Arc<dyn DeliveryTarget>,
    last_active_at_ms: i64,
}

/// Tracks registered channels and when each was last active.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<Vec<RegisteredChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a channel. Registration counts as
    /// activity, so a fresh process with a single configured channel
    /// already has a delivery target.
    pub fn register(&self, target: Arc<dyn DeliveryTarget>) {
        let now = chrono::Utc::now().timestamp_millis();
        let mut channels = self.channels.write().unwrap();
        match channels
            .iter_mut()
            .find(|c| c.target.channel_id() == target.channel_id())
        {
            Some(existing) => {
                existing.target = target;
                existing.last_active_at_ms = now;
            }
            None => channels.push(RegisteredChannel {
                target,
                last_active_at_ms: now,
            }),
        }
    }

    /// Mark a channel as just-interacted-with. Unknown ids are ignored.
    pub fn touch(&self, channel_id: &str) {
        let mut channels = self.channels.write().unwrap();
        if let Some(c) = channels
            .iter_mut()
            .find(|c| c.target.channel_id() == channel_id)
        {
            c.last_active_at_ms = chrono::Utc::now().timestamp_millis();
        }
    }

    /// Snapshot of all registered channels.
    pub fn list(&self) -> Vec<ChannelInfo> {
        self.channels
            .read()
            .unwrap()
            .iter()
            .map(|c| ChannelInfo {
                channel_id: c.target.channel_id().to_string(),
                last_active_at: Some(c.last_active_at_ms),
            })
            .collect()
    }
}

impl DeliveryResolver for ChannelRegistry {
    fn resolve(&self) -> Option<Arc<dyn DeliveryTarget>> {
        self.channels
            .read()
            .unwrap()
            .iter()
            .max_by_key(|c| c.last_active_at_ms)
            .map(|c| c.target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubTarget {
        id: &'static str,
    }

    #[async_trait::async_trait]
    impl DeliveryTarget for StubTarget {
        fn channel_id(&self) -> &str {
            self.id
        }

        async fn deliver(&self, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_empty_registry_resolves_none() {
        let registry = ChannelRegistry::new();
        assert!(registry.resolve().is_none());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_resolve_picks_most_recently_active() {
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(StubTarget { id: "alpha" }));
        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.register(Arc::new(StubTarget { id: "beta" }));

        assert_eq!(registry.resolve().unwrap().channel_id(), "beta");

        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.touch("alpha");
        assert_eq!(registry.resolve().unwrap().channel_id(), "alpha");
    }

    #[test]
    fn test_touch_on_unknown_id_is_ignored() {
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(StubTarget { id: "alpha" }));
        registry.touch("missing");
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.resolve().unwrap().channel_id(), "alpha");
    }

    #[test]
    fn test_reregister_replaces_and_refreshes() {
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(StubTarget { id: "alpha" }));
        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.register(Arc::new(StubTarget { id: "beta" }));
        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.register(Arc::new(StubTarget { id: "alpha" }));

        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.resolve().unwrap().channel_id(), "alpha");
    }

    #[test]
    fn test_list_reports_activity_timestamps() {
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(StubTarget { id: "alpha" }));
        let info = registry.list();
        assert_eq!(info[0].channel_id, "alpha");
        assert!(info[0].last_active_at.is_some());
    }
}
