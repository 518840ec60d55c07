// Business domains
pub mod dispatch;
pub mod machines;
pub mod notifications;
pub mod runs;
pub mod workflows;
