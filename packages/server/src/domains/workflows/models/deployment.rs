use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Where a deployment is routable from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "deployment_environment", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Environment {
    Staging,
    #[default]
    Production,
    PublicShare,
}

/// A bound tuple (workflow version, machine or machine group,
/// environment) the API routes runs against. Read-only for the dispatch
/// core; exactly one of `machine_id` / `machine_group_id` is set.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    pub machine_id: Option<Uuid>,
    pub machine_group_id: Option<Uuid>,
    pub environment: Environment,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Staging deployments must target a single machine, never a group.
    pub fn is_valid_target(&self) -> bool {
        !(self.environment == Environment::Staging && self.machine_group_id.is_some())
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        let deployment = sqlx::query_as::<_, Deployment>("SELECT * FROM deployments WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(deployment)
    }
}
