// Kernel - core infrastructure with dependency injection
//
// The ServerKernel holds all dispatch-core dependencies (queue store,
// machine store, repository, HTTP clients) and provides dependency
// injection through traits for testability.
//
// IMPORTANT: Kernel is for INFRASTRUCTURE only, not business logic.
// Business logic belongs in domain layers.

pub mod machine_backend;
pub mod queue;
pub mod scheduled_tasks;
pub mod server_kernel;
pub mod service_host;
pub mod test_dependencies;
pub mod webhook;

pub use machine_backend::{HttpMachineBackend, MachineBackend, QueueSnapshot, RunPayload};
pub use server_kernel::ServerKernel;
pub use service_host::{Service, ServiceHost};
pub use test_dependencies::{
    InMemoryJobStore, InMemoryMachineStore, InMemoryRepository, MockMachineBackend,
    SpyWebhookSender, TestDependencies,
};
pub use webhook::{HttpWebhookSender, WebhookSender};
