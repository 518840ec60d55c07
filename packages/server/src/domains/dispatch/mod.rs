//! The dispatch core: scheduler, start-run RPC, retry policy,
//! supervisor.

pub mod dispatcher;
pub mod events;
pub mod request;
pub mod retry;
pub mod start_run;
pub mod supervisor;
pub mod worker;

use std::sync::Arc;

use crate::domains::machines::{MachineRegistry, MachineSelector};
use crate::domains::notifications::Notifier;
use crate::domains::runs::CallbackIngestor;
use crate::kernel::ServerKernel;

pub use dispatcher::{DispatchMode, DispatchOutcome, Dispatcher};
pub use events::{DispatchEvent, DispatchLoop, DispatchTrigger};
pub use request::RunRequest;
pub use retry::is_retryable_error;
pub use start_run::{StartRunError, StartRunner};
pub use supervisor::{ServiceStatus, Supervisor, SupervisorStatus};
pub use worker::{RunWorker, StalledJobSweeper};

/// Everything the serving process needs from the dispatch core, wired
/// once from the kernel.
#[derive(Clone)]
pub struct DispatchStack {
    pub registry: Arc<MachineRegistry>,
    pub notifier: Arc<Notifier>,
    pub starter: Arc<StartRunner>,
    pub dispatcher: Arc<Dispatcher>,
    pub ingestor: Arc<CallbackIngestor>,
}

/// Wire the dispatch components against a kernel. The trigger is shared
/// with the API edge (enqueue events) and the ingestor (release events).
pub fn build_dispatch_stack(kernel: &Arc<ServerKernel>, trigger: DispatchTrigger) -> DispatchStack {
    let config = kernel.config.clone();

    let registry = Arc::new(MachineRegistry::new(
        kernel.machines.clone(),
        kernel.machine_backend.clone(),
    ));
    let selector = Arc::new(MachineSelector::new());
    let notifier = Arc::new(Notifier::new(kernel.jobs.clone(), config.clone()));
    let starter = Arc::new(StartRunner::new(
        kernel.repository.clone(),
        kernel.machines.clone(),
        kernel.machine_backend.clone(),
        notifier.clone(),
        config.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        kernel.jobs.clone(),
        registry.clone(),
        selector,
        kernel.repository.clone(),
        starter.clone(),
        notifier.clone(),
        config.clone(),
    ));
    let ingestor = Arc::new(CallbackIngestor::new(
        kernel.repository.clone(),
        registry.clone(),
        notifier.clone(),
        starter.clone(),
        trigger,
        config,
    ));

    DispatchStack {
        registry,
        notifier,
        starter,
        dispatcher,
        ingestor,
    }
}
