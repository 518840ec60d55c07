//! Runs and their outputs, plus callback ingestion.

pub mod ingestor;
pub mod models;
pub mod store;

pub use ingestor::{CallbackError, CallbackIngestor};
pub use models::{Artifact, OutputData, Run, RunOutput, RunStatus};
pub use store::{PostgresRepository, Repository};
