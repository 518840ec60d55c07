//! Named queues backed by the shared `queue_jobs` table.

/// Queue of pending workflow-run requests.
pub const RUN_QUEUE: &str = "workflow-run-queue";

/// Queue of outbound webhook notifications.
pub const NOTIFICATION_QUEUE: &str = "notification-queue";

/// Job id prefix per queue, used when generating new job ids.
pub fn job_id_prefix(queue: &str) -> &'static str {
    match queue {
        NOTIFICATION_QUEUE => "notification",
        _ => "workflow",
    }
}
