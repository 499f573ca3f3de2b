//! HTTP collaborators: the engine client and the webhook channel.

use std::time::Duration;

use serde_json::json;

use vigil_runtime::channels::DeliveryTarget;
use vigil_runtime::engine::ConversationEngine;
use vigil_types::{AskOptions, EngineReply};

/// Conversation engine reached over HTTP.
///
/// Posts `{prompt, session}` to the configured URL and expects a
/// `{text, media?}` reply.
pub struct HttpEngine {
    client: reqwest::Client,
    url: String,
}

impl HttpEngine {
    pub fn new(url: String, timeout_secs: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client, url })
    }

    async fn post(
        &self,
        body: serde_json::Value,
        timeout_ms: Option<u64>,
    ) -> anyhow::Result<EngineReply> {
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(ms) = timeout_ms {
            request = request.timeout(Duration::from_millis(ms));
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("engine request failed ({status}): {body}");
        }

        Ok(response.json().await?)
    }
}

#[async_trait::async_trait]
impl ConversationEngine for HttpEngine {
    async fn ask_with_session(
        &self,
        prompt: &str,
        session: &str,
        options: &AskOptions,
    ) -> anyhow::Result<EngineReply> {
        self.post(
            json!({ "prompt": prompt, "session": session }),
            options.timeout_ms,
        )
        .await
    }

    async fn ask(&self, prompt: &str) -> anyhow::Result<EngineReply> {
        self.post(json!({ "prompt": prompt }), None).await
    }
}

/// Delivery channel that posts `{text}` to a webhook URL.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait::async_trait]
impl DeliveryTarget for WebhookChannel {
    fn channel_id(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, text: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("webhook delivery failed ({status}): {body}");
        }

        Ok(())
    }
}
