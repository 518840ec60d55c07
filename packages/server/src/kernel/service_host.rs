//! Long-running service plumbing.
//!
//! Workers implement [`Service`] and get spawned by the supervisor with
//! a shared [`CancellationToken`]. Graceful shutdown cancels the token
//! and waits for services to drain; forced shutdown aborts them.

use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A long-running background service.
#[async_trait::async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;

    /// Run until the shutdown token is cancelled.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Spawns services and tracks their handles for status and shutdown.
pub struct ServiceHost {
    shutdown: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl ServiceHost {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Spawn a service onto the runtime. A service returning an error is
    /// logged; it is not restarted.
    pub fn spawn(&mut self, service: Box<dyn Service>) {
        let name = service.name().to_string();
        let shutdown = self.shutdown.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            info!(service = %task_name, "service starting");
            if let Err(e) = service.run(shutdown).await {
                error!(service = %task_name, error = %e, "service exited with error");
            } else {
                info!(service = %task_name, "service stopped");
            }
        });

        self.handles.push((name, handle));
    }

    /// Per-service running flags.
    pub fn service_status(&self) -> Vec<(String, bool)> {
        self.handles
            .iter()
            .map(|(name, handle)| (name.clone(), !handle.is_finished()))
            .collect()
    }

    /// Wait for all services to finish, up to `timeout`. Services still
    /// running at the deadline are left to the runtime.
    pub async fn join_all(&mut self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> =
            self.handles.drain(..).map(|(_, handle)| handle).collect();

        let drained = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, drained).await.is_err() {
            info!("some services did not stop before the drain deadline");
        }
    }

    /// Abort every service immediately.
    pub fn abort_all(&mut self) {
        for (_, handle) in self.handles.drain(..) {
            handle.abort();
        }
    }
}
