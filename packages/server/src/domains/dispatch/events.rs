//! Event-driven dispatch: trigger + loop.
//!
//! Dispatch fires on exactly two events: a new enqueue and a machine
//! release. The trigger is a single-slot channel, so a storm of events
//! coalesces into one pending dispatch pass instead of unbounded
//! concurrent dispatch attempts.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use super::dispatcher::Dispatcher;
use crate::kernel::service_host::Service;

#[derive(Debug, Clone, Copy)]
pub enum DispatchEvent {
    JobEnqueued,
    MachineReleased(Uuid),
}

/// Fires dispatch passes. Cloneable; a disabled trigger (worker mode,
/// tests) swallows events.
#[derive(Clone)]
pub struct DispatchTrigger {
    tx: Option<mpsc::Sender<DispatchEvent>>,
}

impl DispatchTrigger {
    /// Single-slot channel: at most one dispatch pass pending.
    pub fn channel() -> (Self, mpsc::Receiver<DispatchEvent>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn fire(&self, event: DispatchEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            // a pass is already pending; this event rides along with it
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Consumes dispatch events and runs dispatch passes. On startup it runs
/// one pass to fill capacity that went idle while the process was down.
pub struct DispatchLoop {
    dispatcher: Arc<Dispatcher>,
    rx: mpsc::Receiver<DispatchEvent>,
}

impl DispatchLoop {
    pub fn new(dispatcher: Arc<Dispatcher>, rx: mpsc::Receiver<DispatchEvent>) -> Self {
        Self { dispatcher, rx }
    }
}

#[async_trait::async_trait]
impl Service for DispatchLoop {
    fn name(&self) -> &'static str {
        "dispatch-loop"
    }

    async fn run(mut self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        if let Err(e) = self.dispatcher.process_all_available_jobs().await {
            error!(error = %e, "startup dispatch pass failed");
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.rx.recv() => {
                    let Some(event) = event else { break };
                    debug!(?event, "dispatch pass triggered");
                    if let Err(e) = self.dispatcher.process_all_available_jobs().await {
                        error!(error = %e, "dispatch pass failed");
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_coalesces_bursts_into_one_slot() {
        let (trigger, mut rx) = DispatchTrigger::channel();

        for _ in 0..10 {
            trigger.fire(DispatchEvent::JobEnqueued);
        }

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disabled_trigger_swallows_events() {
        let trigger = DispatchTrigger::disabled();
        trigger.fire(DispatchEvent::MachineReleased(Uuid::new_v4()));
    }
}
