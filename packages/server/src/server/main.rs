// Main entry point for the dispatch server

use std::sync::Arc;

use anyhow::{Context, Result};
use dispatch_core::domains::dispatch::{build_dispatch_stack, DispatchTrigger, Supervisor};
use dispatch_core::server::{build_app, AppState};
use dispatch_core::{Config, kernel::ServerKernel};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dispatch_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting workflow dispatch server");

    // Load configuration
    let config = Arc::new(Config::from_env().context("Failed to load configuration")?);
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Wire the dispatch core
    let kernel = Arc::new(
        ServerKernel::postgres(pool.clone(), config.clone())
            .context("Failed to build server kernel")?,
    );
    let (trigger, trigger_rx) = DispatchTrigger::channel();
    let stack = build_dispatch_stack(&kernel, trigger.clone());
    let supervisor = Arc::new(Supervisor::new(
        kernel.clone(),
        stack.dispatcher.clone(),
        stack.registry.clone(),
        trigger.clone(),
        trigger_rx,
    ));
    supervisor.start().await.context("Failed to start workers")?;

    // Build application
    let app = build_app(AppState {
        db_pool: pool,
        kernel,
        ingestor: stack.ingestor.clone(),
        supervisor: supervisor.clone(),
        trigger,
    });

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutting down, draining workers...");
    supervisor.stop(false).await?;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
