//! Outbound webhook delivery client.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Delivers webhook bodies; any non-2xx or network error is an `Err`,
/// letting the notification queue schedule retries.
#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn deliver(
        &self,
        url: &str,
        auth_header: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<()>;
}

/// Reqwest-based sender with a 30-second delivery timeout.
pub struct HttpWebhookSender {
    client: Client,
}

impl HttpWebhookSender {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn deliver(
        &self,
        url: &str,
        auth_header: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<()> {
        let mut request = self.client.post(url).json(body);

        if let Some(token) = auth_header {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to deliver webhook to {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("webhook receiver returned {}: {}", status, text);
        }

        Ok(())
    }
}
