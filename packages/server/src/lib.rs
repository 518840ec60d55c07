// Workflow Run Dispatch Server - core library
//
// This crate dispatches user-submitted workflow runs to a fleet of compute
// machines. The dispatch core is a durable Postgres-backed job queue, an
// admission-counting machine registry, an event-driven or worker-pull
// dispatcher, a callback ingestor, and a webhook notification pipeline.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::Config;
