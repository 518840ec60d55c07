//! Enqueues terminal-status notifications onto the notification queue.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::model::Notification;
use crate::common::queues::NOTIFICATION_QUEUE;
use crate::config::Config;
use crate::domains::runs::models::{OutputData, Run, RunStatus};
use crate::kernel::queue::{EnqueueOptions, JobStore};

pub struct Notifier {
    jobs: Arc<dyn JobStore>,
    config: Arc<Config>,
}

impl Notifier {
    pub fn new(jobs: Arc<dyn JobStore>, config: Arc<Config>) -> Self {
        Self { jobs, config }
    }

    /// Queue a webhook for a run that reached a terminal status.
    pub async fn notify_run_terminal(
        &self,
        run: &Run,
        status: RunStatus,
        outputs: Option<OutputData>,
        error: Option<serde_json::Value>,
    ) -> Result<()> {
        self.enqueue(Notification {
            workflow_run_id: run.id.to_string(),
            status,
            job_id: run.queue_job_id.clone(),
            deployment_id: None,
            outputs,
            error,
            completed_at: Utc::now(),
            webhook_url: String::new(),
            auth_header: None,
        })
        .await
    }

    /// Queue a failure webhook for a job that died before a run existed.
    /// The synthetic run id keeps the receiver's schema uniform.
    pub async fn notify_queue_failure(
        &self,
        queue_job_id: &str,
        deployment_id: Option<Uuid>,
        error: &str,
    ) -> Result<()> {
        self.enqueue(Notification {
            workflow_run_id: format!("queue-job-{}", queue_job_id),
            status: RunStatus::Failed,
            job_id: Some(queue_job_id.to_string()),
            deployment_id,
            outputs: None,
            error: Some(json!({ "message": error })),
            completed_at: Utc::now(),
            webhook_url: String::new(),
            auth_header: None,
        })
        .await
    }

    async fn enqueue(&self, mut notification: Notification) -> Result<()> {
        let Some(url) = self.config.webhook_notification_url.clone() else {
            debug!(
                workflow_run_id = %notification.workflow_run_id,
                "no webhook target configured, skipping notification"
            );
            return Ok(());
        };

        notification.webhook_url = url;
        notification.auth_header = self.config.webhook_authorization_header.clone();

        self.jobs
            .enqueue(
                NOTIFICATION_QUEUE,
                serde_json::to_value(&notification)?,
                EnqueueOptions {
                    max_attempts: self.config.notification_max_attempts,
                    delay_until: None,
                },
            )
            .await?;

        Ok(())
    }
}
