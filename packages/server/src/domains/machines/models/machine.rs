use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Which backend flavor a machine runs; decides the run-RPC shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "machine_kind", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum MachineKind {
    Classic,
    ComfyDeployServerless,
    ModalServerless,
    RunpodServerless,
}

impl MachineKind {
    /// Only classic machines expose a queue endpoint to reconcile against.
    pub fn supports_reconcile(&self) -> bool {
        matches!(self, MachineKind::Classic)
    }
}

/// Build/provisioning state reported by machine management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "machine_status", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum MachineStatus {
    #[default]
    Ready,
    Building,
    Error,
}

/// Whether the machine currently holds admitted work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "machine_operational_status", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum OperationalStatus {
    #[default]
    Idle,
    Busy,
}

/// A compute backend with a bounded concurrent capacity.
///
/// `current_queue` and `operational_status` are owned by the machine
/// store's admit/release operations; nothing else mutates them.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Machine {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub name: String,
    pub kind: MachineKind,
    pub endpoint: String,
    #[builder(default, setter(strip_option))]
    pub auth_token: Option<String>,
    #[builder(default)]
    pub status: MachineStatus,
    #[builder(default)]
    pub operational_status: OperationalStatus,
    #[builder(default = 0)]
    pub current_queue: i32,
    #[builder(default = 1)]
    pub capacity: i32,
    #[builder(default = false)]
    pub disabled: bool,
    #[builder(default, setter(strip_option))]
    pub machine_group_id: Option<Uuid>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Machine {
    /// A machine may be admitted to iff it is enabled, ready, and has a
    /// free slot.
    pub fn is_eligible(&self) -> bool {
        self.ineligibility_reason().is_none()
    }

    /// The specific reason this machine cannot take work, if any.
    pub fn ineligibility_reason(&self) -> Option<String> {
        if self.disabled {
            return Some("disabled".to_string());
        }
        if self.status != MachineStatus::Ready {
            return Some(format!("status={}", enum_label(&self.status)));
        }
        if self.current_queue >= self.capacity {
            return Some(format!(
                "queue_full({}/{})",
                self.current_queue, self.capacity
            ));
        }
        None
    }

    /// Find a machine by ID
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        let machine = sqlx::query_as::<_, Machine>("SELECT * FROM machines WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(machine)
    }

    /// All machines, for eligibility reporting
    pub async fn find_all(pool: &PgPool) -> Result<Vec<Self>> {
        let machines = sqlx::query_as::<_, Machine>("SELECT * FROM machines ORDER BY name")
            .fetch_all(pool)
            .await?;
        Ok(machines)
    }

    /// Members of a machine group
    pub async fn find_by_group(group_id: Uuid, pool: &PgPool) -> Result<Vec<Self>> {
        let machines = sqlx::query_as::<_, Machine>(
            "SELECT * FROM machines WHERE machine_group_id = $1 ORDER BY name",
        )
        .bind(group_id)
        .fetch_all(pool)
        .await?;
        Ok(machines)
    }
}

fn enum_label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => "unknown".to_string(),
    }
}
