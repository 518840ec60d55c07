//! HTTP client for machine backends.
//!
//! Two calls: the "start run" RPC that hands a workflow graph to a
//! machine, and the queue probe used for drift reconciliation. The RPC
//! shape depends on the machine kind; serverless kinds wrap the payload
//! in an `input` envelope and runpod additionally requires bearer auth.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::domains::machines::{Machine, MachineKind};

/// Body of the start-run RPC. Field names are the machine-side wire
/// contract; `workflow_api_raw` can be megabytes of graph JSON.
#[derive(Debug, Clone, Serialize)]
pub struct RunPayload {
    pub prompt_id: Uuid,
    pub workflow_api_raw: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<serde_json::Value>,
    pub status_endpoint: String,
    pub file_upload_endpoint: String,
}

/// Queue depth reported by a classic machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub running: usize,
    pub pending: usize,
}

impl QueueSnapshot {
    pub fn depth(&self) -> i32 {
        (self.running + self.pending) as i32
    }
}

#[derive(Deserialize)]
struct QueueResponse {
    #[serde(default)]
    queue_running: Vec<serde_json::Value>,
    #[serde(default)]
    queue_pending: Vec<serde_json::Value>,
}

/// Outbound calls to a machine backend.
#[async_trait]
pub trait MachineBackend: Send + Sync {
    /// POST the run payload to the machine's start-run endpoint.
    async fn start_run(&self, machine: &Machine, payload: &RunPayload) -> Result<()>;

    /// Probe a classic machine's queue (5s timeout).
    async fn queue_status(&self, machine: &Machine) -> Result<QueueSnapshot>;
}

/// Reqwest-based backend client.
pub struct HttpMachineBackend {
    client: Client,
}

const QUEUE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

impl HttpMachineBackend {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    fn run_url(machine: &Machine) -> String {
        let endpoint = machine.endpoint.trim_end_matches('/');
        match machine.kind {
            MachineKind::Classic => format!("{}/comfyui-deploy/run", endpoint),
            _ => format!("{}/run", endpoint),
        }
    }

    fn is_local_endpoint(endpoint: &str) -> bool {
        Url::parse(endpoint)
            .ok()
            .and_then(|url| url.host_str().map(|h| h.to_string()))
            .map(|host| host == "localhost" || host == "127.0.0.1")
            .unwrap_or(false)
    }
}

#[async_trait]
impl MachineBackend for HttpMachineBackend {
    async fn start_run(&self, machine: &Machine, payload: &RunPayload) -> Result<()> {
        let url = Self::run_url(machine);

        let body = match machine.kind {
            MachineKind::Classic => serde_json::to_value(payload)?,
            _ => serde_json::json!({ "input": payload }),
        };

        let mut request = self.client.post(&url).json(&body);

        if machine.kind == MachineKind::RunpodServerless
            && !Self::is_local_endpoint(&machine.endpoint)
        {
            let token = machine
                .auth_token
                .as_deref()
                .context("runpod machine has no auth token")?;
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach machine at {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("machine rejected run: {} - {}", status, text);
        }

        Ok(())
    }

    async fn queue_status(&self, machine: &Machine) -> Result<QueueSnapshot> {
        let url = format!("{}/queue", machine.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .timeout(QUEUE_PROBE_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Failed to probe queue at {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            bail!("queue probe failed: {}", status);
        }

        let queue: QueueResponse = response
            .json()
            .await
            .context("Failed to parse queue response")?;

        Ok(QueueSnapshot {
            running: queue.queue_running.len(),
            pending: queue.queue_pending.len(),
        })
    }
}
