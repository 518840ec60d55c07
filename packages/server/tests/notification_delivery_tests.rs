//! Webhook delivery through the notification queue and worker.

mod common;

use common::*;

use std::time::Duration;

use dispatch_core::common::queues::NOTIFICATION_QUEUE;
use dispatch_core::domains::notifications::NotificationWorker;
use dispatch_core::kernel::queue::{JobState, JobStore};
use dispatch_core::kernel::Service;
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Run a notification worker long enough to drain ready jobs.
async fn run_worker_briefly(h: &TestHarness) {
    let worker = NotificationWorker::new(h.deps.jobs.clone(), h.deps.webhooks.clone(), 0);
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(Service::run(Box::new(worker), shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn queued_notifications_are_posted_with_bearer_auth() {
    let mut config = test_config();
    config.webhook_authorization_header = Some("hook-secret".to_string());
    let h = harness_with(config);

    h.stack
        .notifier
        .notify_queue_failure("workflow-1-abc", None, "deployment not found")
        .await
        .unwrap();

    run_worker_briefly(&h).await;

    let deliveries = h.deps.webhooks.deliveries();
    assert_eq!(deliveries.len(), 1);

    let (url, auth, body) = &deliveries[0];
    assert_eq!(url, "https://hooks.example.com/runs");
    assert_eq!(auth.as_deref(), Some("hook-secret"));
    assert_eq!(body["workflow_run_id"], json!("queue-job-workflow-1-abc"));
    assert_eq!(body["status"], json!("failed"));
    assert!(body.get("webhook_url").is_none());

    // the queue job is completed and retained
    assert_eq!(
        h.deps
            .jobs
            .count_in_state(NOTIFICATION_QUEUE, JobState::Completed)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn failed_deliveries_are_parked_after_attempts_run_out() {
    let mut config = test_config();
    config.notification_max_attempts = 1;
    let h = harness_with(config);

    h.deps.webhooks.fail_next(1);
    h.stack
        .notifier
        .notify_queue_failure("workflow-2-def", None, "machine rejected run")
        .await
        .unwrap();

    run_worker_briefly(&h).await;

    // one attempt, no delivery, retained as failed for inspection
    assert_eq!(h.deps.webhooks.delivery_count(), 0);

    let failed = h
        .deps
        .jobs
        .jobs_in_state(NOTIFICATION_QUEUE, JobState::Failed, 0, 10)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].failed_reason.as_deref().unwrap().contains("503"));
}

#[tokio::test]
async fn transient_delivery_failures_back_off_and_retry() {
    let h = harness();

    h.deps.webhooks.fail_next(1);
    h.stack
        .notifier
        .notify_queue_failure("workflow-3-ghi", None, "boom")
        .await
        .unwrap();

    run_worker_briefly(&h).await;

    // first attempt failed; the job is parked in delayed with backoff
    assert_eq!(h.deps.webhooks.delivery_count(), 0);
    let delayed = h
        .deps
        .jobs
        .jobs_in_state(NOTIFICATION_QUEUE, JobState::Delayed, 0, 10)
        .await
        .unwrap();
    assert_eq!(delayed.len(), 1);
    assert_eq!(delayed[0].attempts_made, 1);
    assert!(delayed[0].delay_until.is_some());
}

#[tokio::test]
async fn no_webhook_target_means_no_notification() {
    let mut config = test_config();
    config.webhook_notification_url = None;
    let h = harness_with(config);

    h.stack
        .notifier
        .notify_queue_failure("workflow-4-jkl", None, "whatever")
        .await
        .unwrap();

    assert_eq!(
        h.deps
            .jobs
            .count_in_state(NOTIFICATION_QUEUE, JobState::Waiting)
            .await
            .unwrap(),
        0
    );
}
