//! Process-lifecycle owner for the dispatch core.
//!
//! The supervisor is a value owned by `main` (no globals): `start`
//! spawns the dispatch regime, the notification workers, and the
//! maintenance scheduler; `stop` drains or aborts them; `status` is
//! surfaced through the health endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_cron_scheduler::JobScheduler;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::dispatcher::Dispatcher;
use super::events::{DispatchEvent, DispatchLoop, DispatchTrigger};
use super::worker::{RunWorker, StalledJobSweeper};
use crate::domains::machines::MachineRegistry;
use crate::domains::notifications::NotificationWorker;
use crate::kernel::queue::JobStore;
use crate::kernel::scheduled_tasks::start_scheduler;
use crate::kernel::service_host::ServiceHost;
use crate::kernel::ServerKernel;

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub running: bool,
    pub store_connected: bool,
    pub event_driven: bool,
    pub run_worker_concurrency: usize,
    pub notification_worker_concurrency: usize,
    pub services: Vec<ServiceStatus>,
}

pub struct Supervisor {
    kernel: Arc<ServerKernel>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<MachineRegistry>,
    trigger: DispatchTrigger,
    trigger_rx: Mutex<Option<mpsc::Receiver<DispatchEvent>>>,
    shutdown: CancellationToken,
    host: Mutex<ServiceHost>,
    scheduler: Mutex<Option<JobScheduler>>,
    started: AtomicBool,
}

impl Supervisor {
    pub fn new(
        kernel: Arc<ServerKernel>,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<MachineRegistry>,
        trigger: DispatchTrigger,
        trigger_rx: mpsc::Receiver<DispatchEvent>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            kernel,
            dispatcher,
            registry,
            trigger,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            host: Mutex::new(ServiceHost::new(shutdown.clone())),
            shutdown,
            scheduler: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the dispatch regime, notification workers, and maintenance
    /// scheduler. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let config = &self.kernel.config;
        let mut host = self.host.lock().await;

        if config.use_event_driven_scheduler {
            let rx = self
                .trigger_rx
                .lock()
                .await
                .take()
                .context("dispatch trigger receiver already consumed")?;
            host.spawn(Box::new(DispatchLoop::new(self.dispatcher.clone(), rx)));
            host.spawn(Box::new(StalledJobSweeper::new(
                self.kernel.jobs.clone(),
                self.trigger.clone(),
                config,
            )));
        } else {
            for index in 0..config.worker_concurrency {
                host.spawn(Box::new(RunWorker::new(
                    self.kernel.jobs.clone(),
                    self.dispatcher.clone(),
                    config.clone(),
                    index,
                )));
            }
        }

        for index in 0..config.notification_worker_concurrency {
            host.spawn(Box::new(NotificationWorker::new(
                self.kernel.jobs.clone(),
                self.kernel.webhook_sender.clone(),
                index,
            )));
        }

        let scheduler = start_scheduler(self.kernel.clone(), self.registry.clone()).await?;
        *self.scheduler.lock().await = Some(scheduler);

        info!(
            event_driven = config.use_event_driven_scheduler,
            worker_concurrency = config.worker_concurrency,
            notification_concurrency = config.notification_worker_concurrency,
            "supervisor started"
        );
        Ok(())
    }

    /// Stop all services. Graceful stop (`force = false`) lets in-flight
    /// jobs finish; forced stop aborts them (the queue store recovers
    /// their expired locks later).
    pub async fn stop(&self, force: bool) -> Result<()> {
        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            let _ = scheduler.shutdown().await;
        }

        self.shutdown.cancel();

        let mut host = self.host.lock().await;
        if force {
            host.abort_all();
        } else {
            host.join_all(Duration::from_secs(30)).await;
        }

        self.started.store(false, Ordering::SeqCst);
        info!(force, "supervisor stopped");
        Ok(())
    }

    pub async fn status(&self) -> SupervisorStatus {
        let services = self
            .host
            .lock()
            .await
            .service_status()
            .into_iter()
            .map(|(name, running)| ServiceStatus { name, running })
            .collect();

        SupervisorStatus {
            running: self.started.load(Ordering::SeqCst),
            store_connected: self.kernel.jobs.ping().await.is_ok(),
            event_driven: self.kernel.config.use_event_driven_scheduler,
            run_worker_concurrency: self.kernel.config.worker_concurrency,
            notification_worker_concurrency: self.kernel.config.notification_worker_concurrency,
            services,
        }
    }
}
