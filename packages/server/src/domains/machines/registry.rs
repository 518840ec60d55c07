//! Per-machine admission accounting and drift reconciliation.
//!
//! The registry is the only writer of `current_queue` and
//! `operational_status`. Admission is advisory-checked by the selector
//! and then enforced here with a single conditional update, so a full
//! machine can never be oversubscribed under concurrent dispatchers.
//! Reconciliation exists because terminal callbacks can be lost; it
//! pulls the true depth back from the backend.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use uuid::Uuid;

use super::models::Machine;
use super::store::MachineStore;
use crate::kernel::machine_backend::MachineBackend;

/// Result of reconciling one machine.
#[derive(Debug)]
pub struct ReconcileReport {
    pub machine_id: Uuid,
    pub name: String,
    /// New queue depth on success, error text on failure.
    pub result: Result<i32, String>,
}

pub struct MachineRegistry {
    store: Arc<dyn MachineStore>,
    backend: Arc<dyn MachineBackend>,
}

impl MachineRegistry {
    pub fn new(store: Arc<dyn MachineStore>, backend: Arc<dyn MachineBackend>) -> Self {
        Self { store, backend }
    }

    pub fn store(&self) -> &Arc<dyn MachineStore> {
        &self.store
    }

    /// Take one slot on the machine if it is eligible and below
    /// `min(capacity, capacity_hint)`. Returns false when the machine is
    /// full, not ready, or disabled; the caller leaves the job queued.
    pub async fn admit(&self, machine_id: Uuid, capacity_hint: Option<i32>) -> Result<bool> {
        let admitted = self.store.try_admit(machine_id, capacity_hint).await?;
        if admitted {
            info!(machine_id = %machine_id, "admitted run on machine");
        }
        Ok(admitted)
    }

    /// Give one slot back. Callers guarantee exactly one release per
    /// successful admit; the store clamps at zero regardless.
    pub async fn release(&self, machine_id: Uuid) -> Result<()> {
        self.store.release_slot(machine_id).await?;
        info!(machine_id = %machine_id, "released machine slot");
        Ok(())
    }

    /// Pull the true queue depth from a classic machine's backend and
    /// overwrite the local counter. Probe failure is reported without
    /// mutating state.
    pub async fn reconcile(&self, machine_id: Uuid) -> Result<i32> {
        let machine = self
            .store
            .find(machine_id)
            .await?
            .with_context(|| format!("machine {} not found", machine_id))?;

        if !machine.kind.supports_reconcile() {
            anyhow::bail!("machine {} ({}) has no queue endpoint", machine.name, machine_id);
        }

        let snapshot = self.backend.queue_status(&machine).await?;
        let depth = snapshot.depth();
        self.store.set_queue_depth(machine_id, depth).await?;

        info!(
            machine_id = %machine_id,
            running = snapshot.running,
            pending = snapshot.pending,
            "reconciled machine queue depth"
        );

        Ok(depth)
    }

    /// Reconcile every eligible classic machine; returns per-machine
    /// results without short-circuiting on failure.
    pub async fn reconcile_all(&self) -> Result<Vec<ReconcileReport>> {
        let machines = self.store.all().await?;
        let mut reports = Vec::new();

        for machine in machines {
            if !machine.kind.supports_reconcile() || machine.disabled {
                continue;
            }

            let result = match self.reconcile(machine.id).await {
                Ok(depth) => Ok(depth),
                Err(e) => {
                    warn!(machine_id = %machine.id, error = %e, "reconcile failed");
                    Err(e.to_string())
                }
            };

            reports.push(ReconcileReport {
                machine_id: machine.id,
                name: machine.name,
                result,
            });
        }

        Ok(reports)
    }

    /// All machines, split into eligible and not. Ineligible machines are
    /// logged with the specific reason.
    pub async fn eligible_machines(&self) -> Result<Vec<Machine>> {
        let machines = self.store.all().await?;
        let mut eligible = Vec::new();

        for machine in machines {
            match machine.ineligibility_reason() {
                None => eligible.push(machine),
                Some(reason) => {
                    info!(machine = %machine.name, machine_id = %machine.id, reason = %reason, "machine unavailable");
                }
            }
        }

        Ok(eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::machines::models::{MachineKind, OperationalStatus};
    use crate::kernel::test_dependencies::{InMemoryMachineStore, MockMachineBackend};

    fn registry() -> (
        Arc<InMemoryMachineStore>,
        Arc<MockMachineBackend>,
        MachineRegistry,
    ) {
        let store = Arc::new(InMemoryMachineStore::new());
        let backend = Arc::new(MockMachineBackend::new());
        let registry = MachineRegistry::new(store.clone(), backend.clone());
        (store, backend, registry)
    }

    fn machine(kind: MachineKind, capacity: i32) -> Machine {
        Machine::builder()
            .name("gpu-1")
            .kind(kind)
            .endpoint("http://gpu-1:8188")
            .capacity(capacity)
            .build()
    }

    #[tokio::test]
    async fn admit_and_release_track_the_queue_depth() {
        let (store, _, registry) = registry();
        let m = machine(MachineKind::Classic, 2);
        store.insert(m.clone());

        assert!(registry.admit(m.id, None).await.unwrap());
        assert!(registry.admit(m.id, None).await.unwrap());
        assert!(!registry.admit(m.id, None).await.unwrap());

        let now = store.get(m.id).unwrap();
        assert_eq!(now.current_queue, 2);
        assert_eq!(now.operational_status, OperationalStatus::Busy);

        registry.release(m.id).await.unwrap();
        registry.release(m.id).await.unwrap();

        let now = store.get(m.id).unwrap();
        assert_eq!(now.current_queue, 0);
        assert_eq!(now.operational_status, OperationalStatus::Idle);
    }

    #[tokio::test]
    async fn release_never_goes_negative() {
        let (store, _, registry) = registry();
        let m = machine(MachineKind::Classic, 1);
        store.insert(m.clone());

        registry.release(m.id).await.unwrap();
        assert_eq!(store.get(m.id).unwrap().current_queue, 0);
    }

    #[tokio::test]
    async fn capacity_hint_lowers_the_admission_ceiling() {
        let (store, _, registry) = registry();
        let m = machine(MachineKind::Classic, 5);
        store.insert(m.clone());

        assert!(registry.admit(m.id, Some(1)).await.unwrap());
        assert!(!registry.admit(m.id, Some(1)).await.unwrap());
    }

    #[tokio::test]
    async fn reconcile_overwrites_depth_from_the_backend() {
        let (store, backend, registry) = registry();
        let m = machine(MachineKind::Classic, 5);
        store.insert(m.clone());
        backend.set_queue_snapshot(m.id, 2, 1);

        let depth = registry.reconcile(m.id).await.unwrap();

        assert_eq!(depth, 3);
        let now = store.get(m.id).unwrap();
        assert_eq!(now.current_queue, 3);
        assert_eq!(now.operational_status, OperationalStatus::Busy);
    }

    #[tokio::test]
    async fn reconcile_failure_leaves_state_untouched() {
        let (store, _, registry) = registry();
        let mut m = machine(MachineKind::Classic, 5);
        m.current_queue = 2;
        store.insert(m.clone());

        // no snapshot configured: the probe fails
        assert!(registry.reconcile(m.id).await.is_err());
        assert_eq!(store.get(m.id).unwrap().current_queue, 2);
    }

    #[tokio::test]
    async fn reconcile_all_skips_serverless_and_disabled_machines() {
        let (store, backend, registry) = registry();

        let classic = machine(MachineKind::Classic, 5);
        store.insert(classic.clone());
        backend.set_queue_snapshot(classic.id, 0, 0);

        let serverless = Machine::builder()
            .name("modal-1")
            .kind(MachineKind::ModalServerless)
            .endpoint("https://app.modal.run")
            .build();
        store.insert(serverless);

        let mut disabled = machine(MachineKind::Classic, 5);
        disabled.name = "gpu-2".to_string();
        disabled.id = uuid::Uuid::new_v4();
        disabled.disabled = true;
        store.insert(disabled);

        let reports = registry.reconcile_all().await.unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].machine_id, classic.id);
        assert!(reports[0].result.is_ok());
    }
}
