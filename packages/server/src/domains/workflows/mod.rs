//! Workflows, versions, deployments (read-mostly for the dispatch core).

pub mod inputs;
pub mod models;

pub use inputs::{apply_external_inputs, RunInputs};
pub use models::{Deployment, Environment, WorkflowVersion};
