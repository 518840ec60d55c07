mod deployment;
mod workflow_version;

pub use deployment::{Deployment, Environment};
pub use workflow_version::WorkflowVersion;
