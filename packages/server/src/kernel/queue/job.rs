//! Queue job model for the durable job store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::common::queues::job_id_prefix;

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "queue_job_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Prioritized,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    /// States a claim may pull from (delayed jobs become claimable once
    /// their `delay_until` has passed).
    pub fn is_runnable(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Prioritized)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Prioritized => "prioritized",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One durable job envelope. The payload is opaque JSON owned by the
/// producing side (a run request or a notification).
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: String,
    pub queue: String,
    /// Epoch seconds at enqueue time; lower dispatches earlier.
    pub priority: i64,
    pub data: serde_json::Value,
    pub state: JobState,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub delay_until: Option<DateTime<Utc>>,
    pub lock_token: Option<Uuid>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub return_value: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueJob {
    /// Build a fresh waiting job for `queue`.
    pub fn new(queue: &str, data: serde_json::Value, max_attempts: i32) -> Self {
        let now = Utc::now();
        Self {
            id: generate_job_id(queue, now),
            queue: queue.to_string(),
            priority: now.timestamp(),
            data,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts,
            delay_until: None,
            lock_token: None,
            lock_expires_at: None,
            return_value: None,
            failed_reason: None,
            processed_on: None,
            finished_on: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether all transient-retry budget has been spent.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }
}

/// Job ids follow `{prefix}-{epoch_ms}-{random}` so they sort roughly by
/// submission time and stay greppable in logs.
pub fn generate_job_id(queue: &str, now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        job_id_prefix(queue),
        now.timestamp_millis(),
        &suffix[..8]
    )
}

/// A claimed job plus the exclusive token the claim holds. Every
/// state-changing call for this job must present the token.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: QueueJob,
    pub token: Uuid,
}

impl ClaimedJob {
    /// Deserialize the job payload.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.job.data.clone())
            .map_err(|e| anyhow::anyhow!("failed to deserialize job {}: {}", self.job.id, e))
    }
}
