//! Machine persistence with atomic capacity accounting.
//!
//! Admit and release are single conditional updates in the backing
//! store; there is no read-then-write window, so concurrent dispatchers
//! cannot oversubscribe a machine even across processes.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::Machine;

/// Storage operations for machines.
#[async_trait]
pub trait MachineStore: Send + Sync {
    async fn find(&self, id: Uuid) -> Result<Option<Machine>>;

    /// Every machine in the fleet (for eligibility reporting).
    async fn all(&self) -> Result<Vec<Machine>>;

    /// Members of a machine group.
    async fn group_members(&self, group_id: Uuid) -> Result<Vec<Machine>>;

    /// Atomically take one slot if the machine is eligible and below
    /// `min(capacity, capacity_hint)`. Returns whether the slot was taken.
    async fn try_admit(&self, id: Uuid, capacity_hint: Option<i32>) -> Result<bool>;

    /// Atomically give one slot back, clamped at zero; the machine goes
    /// idle when the count reaches zero.
    async fn release_slot(&self, id: Uuid) -> Result<()>;

    /// Overwrite the queue depth from an authoritative backend report.
    async fn set_queue_depth(&self, id: Uuid, depth: i32) -> Result<()>;
}

/// PostgreSQL-backed machine store.
pub struct PostgresMachineStore {
    pool: PgPool,
}

impl PostgresMachineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MachineStore for PostgresMachineStore {
    async fn find(&self, id: Uuid) -> Result<Option<Machine>> {
        Machine::find_by_id(id, &self.pool).await
    }

    async fn all(&self) -> Result<Vec<Machine>> {
        Machine::find_all(&self.pool).await
    }

    async fn group_members(&self, group_id: Uuid) -> Result<Vec<Machine>> {
        Machine::find_by_group(group_id, &self.pool).await
    }

    async fn try_admit(&self, id: Uuid, capacity_hint: Option<i32>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE machines
            SET current_queue = current_queue + 1,
                operational_status = 'busy',
                updated_at = NOW()
            WHERE id = $1
              AND disabled = FALSE
              AND status = 'ready'
              AND current_queue < LEAST(capacity, COALESCE($2, capacity))
            "#,
        )
        .bind(id)
        .bind(capacity_hint)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_slot(&self, id: Uuid) -> Result<()> {
        // CASE reads the pre-update value: a count of 1 drops to 0 and
        // the machine goes idle.
        sqlx::query(
            r#"
            UPDATE machines
            SET current_queue = GREATEST(current_queue - 1, 0),
                operational_status = CASE WHEN current_queue <= 1 THEN 'idle'::machine_operational_status
                                          ELSE 'busy'::machine_operational_status END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_queue_depth(&self, id: Uuid, depth: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE machines
            SET current_queue = $2,
                operational_status = CASE WHEN $2 = 0 THEN 'idle'::machine_operational_status
                                          ELSE 'busy'::machine_operational_status END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(depth)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
