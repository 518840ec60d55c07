// ServerKernel - core infrastructure with all dependencies
//
// The ServerKernel holds the storage and transport dependencies of the
// dispatch core and provides access via traits for testability.

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;

use super::machine_backend::{HttpMachineBackend, MachineBackend};
use super::queue::{JobStore, PostgresJobStore};
use super::webhook::{HttpWebhookSender, WebhookSender};
use crate::config::Config;
use crate::domains::machines::{MachineStore, PostgresMachineStore};
use crate::domains::runs::store::{PostgresRepository, Repository};

/// ServerKernel holds all dispatch-core dependencies
pub struct ServerKernel {
    pub jobs: Arc<dyn JobStore>,
    pub machines: Arc<dyn MachineStore>,
    pub repository: Arc<dyn Repository>,
    pub machine_backend: Arc<dyn MachineBackend>,
    pub webhook_sender: Arc<dyn WebhookSender>,
    pub config: Arc<Config>,
}

impl ServerKernel {
    /// Creates a new ServerKernel with the given dependencies
    pub fn new(
        jobs: Arc<dyn JobStore>,
        machines: Arc<dyn MachineStore>,
        repository: Arc<dyn Repository>,
        machine_backend: Arc<dyn MachineBackend>,
        webhook_sender: Arc<dyn WebhookSender>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            jobs,
            machines,
            repository,
            machine_backend,
            webhook_sender,
            config,
        }
    }

    /// Production wiring: PostgreSQL stores and HTTP clients.
    pub fn postgres(pool: PgPool, config: Arc<Config>) -> Result<Self> {
        Ok(Self::new(
            Arc::new(PostgresJobStore::new(pool.clone())),
            Arc::new(PostgresMachineStore::new(pool.clone())),
            Arc::new(PostgresRepository::new(pool)),
            Arc::new(HttpMachineBackend::new()?),
            Arc::new(HttpWebhookSender::new()?),
            config,
        ))
    }
}
