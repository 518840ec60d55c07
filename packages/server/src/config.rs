use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

use crate::domains::machines::SelectionStrategy;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,

    /// Parallel run-dispatch processors (worker mode).
    pub worker_concurrency: usize,
    /// Parallel webhook deliveries.
    pub notification_worker_concurrency: usize,

    /// Strategy used to pick a machine out of a group.
    pub load_balancer_strategy: SelectionStrategy,

    /// How long a claimed job stays locked to one processor (ms).
    pub worker_lock_duration_ms: i64,
    /// How often stalled (lock-expired) jobs are rescanned (ms).
    pub worker_stalled_interval_ms: i64,

    /// Ceiling on queue-level transient retries per job.
    pub max_queue_retries: i32,
    /// Flat delay between queue-level retries (ms).
    pub queue_retry_delay_ms: i64,

    /// Disable the pull-based worker pool and dispatch only on enqueue
    /// and machine-release events.
    pub use_event_driven_scheduler: bool,
    /// Safety bound on how many jobs one dispatch pass may admit.
    pub dispatch_batch_limit: usize,

    /// Re-execute a failed run on the same machine when the error is
    /// classified transient.
    pub execution_retry_enabled: bool,
    pub execution_retry_delay_ms: i64,

    /// Target for terminal-status webhooks. Notifications are skipped
    /// entirely when unset.
    pub webhook_notification_url: Option<String>,
    pub webhook_authorization_header: Option<String>,
    /// Delivery attempts before a notification is parked as failed.
    pub notification_max_attempts: i32,

    /// Overrides the request-derived origin for machine callbacks, for
    /// machines that reach the API over a private network.
    pub api_url: Option<String>,
    /// Optional shared secret required on the run-status callback.
    pub callback_shared_secret: Option<String>,

    // Queue retention policy
    pub completed_retention_secs: i64,
    pub completed_retention_count: i64,
    pub run_failed_retention_secs: i64,
    pub notification_completed_retention_secs: i64,
    pub notification_failed_retention_secs: i64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            worker_concurrency: parse_or("WORKER_CONCURRENCY", 5)?,
            notification_worker_concurrency: parse_or("NOTIFICATION_WORKER_CONCURRENCY", 10)?,
            load_balancer_strategy: env::var("LOAD_BALANCER_STRATEGY")
                .unwrap_or_else(|_| "least-load".to_string())
                .parse()
                .context("LOAD_BALANCER_STRATEGY must be 'round-robin' or 'least-load'")?,
            worker_lock_duration_ms: parse_or("WORKER_LOCK_DURATION", 1_800_000)?,
            worker_stalled_interval_ms: parse_or("WORKER_STALLED_INTERVAL", 1_800_000)?,
            max_queue_retries: parse_or("MAX_QUEUE_RETRIES", 200)?,
            queue_retry_delay_ms: parse_or("QUEUE_RETRY_DELAY", 30_000)?,
            use_event_driven_scheduler: flag_or("USE_EVENT_DRIVEN_SCHEDULER", false),
            dispatch_batch_limit: parse_or("DISPATCH_BATCH_LIMIT", 100)?,
            execution_retry_enabled: flag_or("COMFYUI_EXECUTION_RETRY_ENABLED", false),
            execution_retry_delay_ms: parse_or("COMFYUI_EXECUTION_RETRY_DELAY_MS", 5_000)?,
            webhook_notification_url: env::var("WEBHOOK_NOTIFICATION_URL").ok(),
            webhook_authorization_header: env::var("WEBHOOK_AUTHORIZATION_HEADER").ok(),
            notification_max_attempts: parse_or("NOTIFICATION_MAX_ATTEMPTS", 5)?,
            api_url: env::var("API_URL").ok(),
            callback_shared_secret: env::var("CALLBACK_SHARED_SECRET").ok(),
            completed_retention_secs: parse_or("QUEUE_COMPLETED_RETENTION_SECS", 3_600)?,
            completed_retention_count: parse_or("QUEUE_COMPLETED_RETENTION_COUNT", 1_000)?,
            run_failed_retention_secs: parse_or("QUEUE_FAILED_RETENTION_SECS", 86_400)?,
            notification_completed_retention_secs: parse_or(
                "NOTIFICATION_COMPLETED_RETENTION_SECS",
                86_400,
            )?,
            notification_failed_retention_secs: parse_or(
                "NOTIFICATION_FAILED_RETENTION_SECS",
                604_800,
            )?,
        })
    }

    /// Defaults suitable for tests: no database, everything in memory.
    pub fn for_tests() -> Self {
        Self {
            database_url: String::new(),
            port: 0,
            worker_concurrency: 5,
            notification_worker_concurrency: 10,
            load_balancer_strategy: SelectionStrategy::LeastLoad,
            worker_lock_duration_ms: 1_800_000,
            worker_stalled_interval_ms: 1_800_000,
            max_queue_retries: 200,
            queue_retry_delay_ms: 30_000,
            use_event_driven_scheduler: false,
            dispatch_batch_limit: 100,
            execution_retry_enabled: false,
            execution_retry_delay_ms: 5_000,
            webhook_notification_url: None,
            webhook_authorization_header: None,
            notification_max_attempts: 5,
            api_url: None,
            callback_shared_secret: None,
            completed_retention_secs: 3_600,
            completed_retention_count: 1_000,
            run_failed_retention_secs: 86_400,
            notification_completed_retention_secs: 86_400,
            notification_failed_retention_secs: 604_800,
        }
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

fn flag_or(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "TRUE" | "yes"),
        Err(_) => default,
    }
}
