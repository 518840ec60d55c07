mod run;
mod run_output;

pub use run::{Run, RunStatus};
pub use run_output::{Artifact, OutputData, RunOutput};
