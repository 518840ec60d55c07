pub mod health;
pub mod runs;

pub use health::health_handler;
pub use runs::{create_run_handler, run_status_handler, update_run_handler};
