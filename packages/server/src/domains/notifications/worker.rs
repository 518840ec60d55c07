//! Webhook delivery worker.
//!
//! Claims notifications off the notification queue and POSTs them to
//! their destination. Failures go back to the queue with exponential
//! backoff until attempts are exhausted, then stay queryable in the
//! failed state for the retention window.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::model::Notification;
use crate::common::queues::NOTIFICATION_QUEUE;
use crate::kernel::queue::{ClaimedJob, JobStore};
use crate::kernel::service_host::Service;
use crate::kernel::webhook::WebhookSender;

/// Lock long enough to cover the 30s delivery timeout with slack.
const DELIVERY_LOCK_MS: i64 = 60_000;
const EMPTY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Exponential backoff starting at 2 seconds: 2s, 4s, 8s, 16s, ...
pub fn delivery_backoff(attempts_made: i32) -> chrono::Duration {
    let attempt = attempts_made.clamp(1, 10) as u32;
    chrono::Duration::seconds(2i64.pow(attempt))
}

pub struct NotificationWorker {
    jobs: Arc<dyn JobStore>,
    sender: Arc<dyn WebhookSender>,
    worker_id: String,
}

impl NotificationWorker {
    pub fn new(jobs: Arc<dyn JobStore>, sender: Arc<dyn WebhookSender>, index: usize) -> Self {
        Self {
            jobs,
            sender,
            worker_id: format!("notification-worker-{}", index),
        }
    }

    async fn process(&self, claimed: ClaimedJob) {
        let job_id = claimed.job.id.clone();

        let notification: Notification = match claimed.deserialize() {
            Ok(n) => n,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "undeliverable notification payload");
                if let Err(e) = self
                    .jobs
                    .mark_failed(&job_id, claimed.token, &e.to_string())
                    .await
                {
                    warn!(job_id = %job_id, error = %e, "failed to park notification");
                }
                return;
            }
        };

        let result = self
            .sender
            .deliver(
                &notification.webhook_url,
                notification.auth_header.as_deref(),
                &notification.delivery_body(),
            )
            .await;

        match result {
            Ok(()) => {
                debug!(
                    job_id = %job_id,
                    workflow_run_id = %notification.workflow_run_id,
                    "webhook delivered"
                );
                if let Err(e) = self
                    .jobs
                    .mark_completed(&job_id, claimed.token, serde_json::json!({"delivered": true}))
                    .await
                {
                    warn!(job_id = %job_id, error = %e, "failed to complete notification job");
                }
            }
            Err(e) => {
                if claimed.job.attempts_exhausted() {
                    warn!(
                        job_id = %job_id,
                        attempts = claimed.job.attempts_made,
                        error = %e,
                        "webhook delivery exhausted retries"
                    );
                    if let Err(e) = self
                        .jobs
                        .mark_failed(&job_id, claimed.token, &e.to_string())
                        .await
                    {
                        warn!(job_id = %job_id, error = %e, "failed to park notification");
                    }
                } else {
                    let retry_at = Utc::now() + delivery_backoff(claimed.job.attempts_made);
                    warn!(
                        job_id = %job_id,
                        attempt = claimed.job.attempts_made,
                        retry_at = %retry_at,
                        error = %e,
                        "webhook delivery failed, retrying"
                    );
                    if let Err(e) = self
                        .jobs
                        .move_to_delayed(&job_id, claimed.token, retry_at)
                        .await
                    {
                        warn!(job_id = %job_id, error = %e, "failed to delay notification job");
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Service for NotificationWorker {
    fn name(&self) -> &'static str {
        "notification-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let claimed = match self
                .jobs
                .claim_next(NOTIFICATION_QUEUE, &self.worker_id, DELIVERY_LOCK_MS)
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(worker_id = %self.worker_id, error = %e, "failed to claim notification");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            match claimed {
                Some(claimed) => self.process(claimed).await,
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(EMPTY_POLL_INTERVAL) => {}
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_two_seconds() {
        assert_eq!(delivery_backoff(1), chrono::Duration::seconds(2));
        assert_eq!(delivery_backoff(2), chrono::Duration::seconds(4));
        assert_eq!(delivery_backoff(3), chrono::Duration::seconds(8));
        assert_eq!(delivery_backoff(4), chrono::Duration::seconds(16));
    }

    #[test]
    fn backoff_clamps_zero_attempts_to_the_first_step() {
        assert_eq!(delivery_backoff(0), chrono::Duration::seconds(2));
    }
}
