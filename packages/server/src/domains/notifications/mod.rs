//! Webhook notifications: at-least-once delivery of terminal run status.

pub mod model;
pub mod notifier;
pub mod worker;

pub use model::Notification;
pub use notifier::Notifier;
pub use worker::NotificationWorker;
