use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Lifecycle of one execution attempt. Terminal states are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "run_status", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    #[default]
    NotStarted,
    Running,
    Uploading,
    Success,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::NotStarted => "not-started",
            RunStatus::Running => "running",
            RunStatus::Uploading => "uploading",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One attempt at executing a workflow version on a chosen machine.
///
/// Only the dispatcher writes `not-started -> running`; only the
/// callback ingestor writes terminal states.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Run {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    #[builder(default, setter(strip_option))]
    pub workflow_inputs: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub machine_id: Option<Uuid>,
    #[builder(default = "api".to_string())]
    pub origin: String,
    /// Base URL machines call back on; resolved once at dispatch.
    pub callback_origin: String,
    #[builder(default, setter(strip_option))]
    pub queue_job_id: Option<String>,
    #[builder(default)]
    pub status: RunStatus,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default, setter(strip_option))]
    pub user_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub org_id: Option<String>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub ended_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Whether the execution-retry budget still has room.
    pub fn can_retry_execution(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(run)
    }

    pub async fn find_by_queue_job(queue_job_id: &str, pool: &PgPool) -> Result<Option<Self>> {
        let run = sqlx::query_as::<_, Run>(
            "SELECT * FROM runs WHERE queue_job_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(queue_job_id)
        .fetch_optional(pool)
        .await?;
        Ok(run)
    }

    pub async fn insert(&self, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (
                id, workflow_id, workflow_version_id, workflow_inputs, machine_id,
                origin, callback_origin, queue_job_id, status, retry_count, max_retries,
                user_id, org_id, created_at, started_at, ended_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(self.id)
        .bind(self.workflow_id)
        .bind(self.workflow_version_id)
        .bind(&self.workflow_inputs)
        .bind(self.machine_id)
        .bind(&self.origin)
        .bind(&self.callback_origin)
        .bind(&self.queue_job_id)
        .bind(self.status)
        .bind(self.retry_count)
        .bind(self.max_retries)
        .bind(&self.user_id)
        .bind(&self.org_id)
        .bind(self.created_at)
        .bind(self.started_at)
        .bind(self.ended_at)
        .bind(self.updated_at)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Mark the run running once the backend acknowledged the RPC.
    pub async fn mark_started(id: Uuid, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET status = 'running', started_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Write a new status, returning the previous one. Terminal statuses
    /// also stamp `ended_at`. The row is locked for the duration so
    /// concurrent ingestors observe a consistent previous status.
    pub async fn transition_status(
        id: Uuid,
        status: RunStatus,
        pool: &PgPool,
    ) -> Result<Option<RunStatus>> {
        let previous = sqlx::query_scalar::<_, RunStatus>(
            r#"
            WITH prev AS (
                SELECT id, status AS old_status FROM runs WHERE id = $1 FOR UPDATE
            )
            UPDATE runs r
            SET status = $2,
                ended_at = CASE WHEN $2 IN ('success', 'failed') THEN NOW() ELSE r.ended_at END,
                updated_at = NOW()
            FROM prev
            WHERE r.id = prev.id
            RETURNING prev.old_status
            "#,
        )
        .bind(id)
        .bind(status)
        .fetch_optional(pool)
        .await?;

        Ok(previous)
    }

    /// Spend one unit of the execution-retry budget.
    pub async fn bump_retry(id: Uuid, pool: &PgPool) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET retry_count = retry_count + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::NotStarted.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Uploading.is_terminal());
    }

    #[test]
    fn new_run_defaults() {
        let run = Run::builder()
            .workflow_id(Uuid::new_v4())
            .workflow_version_id(Uuid::new_v4())
            .callback_origin("http://localhost:8080")
            .build();

        assert_eq!(run.status, RunStatus::NotStarted);
        assert_eq!(run.retry_count, 0);
        assert_eq!(run.max_retries, 3);
        assert!(run.can_retry_execution());
    }
}
