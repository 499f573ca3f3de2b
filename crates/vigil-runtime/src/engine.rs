//! Conversation engine contract.

use vigil_types::{AskOptions, EngineReply};

/// A conversation backend that can answer prompts.
///
/// Implementations own all session state; callers only name the
/// session. All methods take `&self`; implementations keep any mutable
/// state behind interior mutability.
#[async_trait::async_trait]
pub trait ConversationEngine: Send + Sync {
    /// Ask within a named persistent session. Calls that share a
    /// `session` share conversation history.
    async fn ask_with_session(
        &self,
        prompt: &str,
        session: &str,
        options: &AskOptions,
    ) -> anyhow::Result<EngineReply>;

    /// One-off ask with no session attached.
    async fn ask(&self, prompt: &str) -> anyhow::Result<EngineReply>;
}
