use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// One immutable snapshot of a workflow: the optional UI graph and the
/// executable `workflow_api` graph posted to machines.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version: i32,
    pub workflow: Option<serde_json::Value>,
    pub workflow_api: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl WorkflowVersion {
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        let version =
            sqlx::query_as::<_, WorkflowVersion>("SELECT * FROM workflow_versions WHERE id = $1")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(version)
    }
}
