//! modelwatch - LLM API availability monitor
//!
//! Periodically probes (provider, model) pairs, classifies the responses
//! with ordered status rules and serves uptime timelines over a JSON API.

mod classify;
mod config;
mod db;
mod probe;
mod scheduler;
mod timeline;
mod web;

use config::ServerConfig;
use db::Store;
use probe::ProbeExecutor;
use scheduler::{RetentionCleaner, Scheduler, SchedulerSettings};
use web::Server;

use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("modelwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    cfg.validate()?;
    tracing::info!("Starting modelwatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Store::new(&cfg.db_path)?;
    if db::seed_defaults(&store)? {
        tracing::info!("Seeded default template, models and status rules");
    }
    tracing::info!("Database initialized successfully");

    // Start scheduler and retention cleaner
    let scheduler = Scheduler::new(store.clone(), ProbeExecutor::new()?, SchedulerSettings::from_config(&cfg));
    scheduler.start();

    let cleaner = RetentionCleaner::new(
        store.clone(),
        cfg.retention_days,
        Duration::from_secs(cfg.cleanup_interval_secs),
    );
    cleaner.start().await;

    // Start web server
    let server = Server::new(cfg, store, scheduler.clone());
    server.start(shutdown_signal()).await?;

    tracing::info!("Shutting down, draining in-flight probes");
    cleaner.stop().await;
    scheduler.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
