//! Outbound webhook notification envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::domains::runs::models::{OutputData, RunStatus};

/// A queued terminal-status notification. The destination travels with
/// the envelope so a config change never redirects already-queued
/// deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Run id, or `queue-job-{id}` for jobs that failed before a run
    /// existed.
    pub workflow_run_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<OutputData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    pub completed_at: DateTime<Utc>,
    pub webhook_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<String>,
}

impl Notification {
    /// The POSTed body: the envelope minus its delivery destination.
    pub fn delivery_body(&self) -> serde_json::Value {
        json!({
            "workflow_run_id": self.workflow_run_id,
            "status": self.status,
            "job_id": self.job_id,
            "deployment_id": self.deployment_id,
            "outputs": self.outputs,
            "error": self.error,
            "completed_at": self.completed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_body_excludes_destination_fields() {
        let notification = Notification {
            workflow_run_id: Uuid::new_v4().to_string(),
            status: RunStatus::Success,
            job_id: Some("workflow-1-abc".to_string()),
            deployment_id: None,
            outputs: None,
            error: None,
            completed_at: Utc::now(),
            webhook_url: "https://example.com/hook".to_string(),
            auth_header: Some("secret".to_string()),
        };

        let body = notification.delivery_body();
        assert!(body.get("webhook_url").is_none());
        assert!(body.get("auth_header").is_none());
        assert_eq!(body["status"], "success");
        assert_eq!(body["job_id"], "workflow-1-abc");
    }
}
