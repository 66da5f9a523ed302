mod accounts;
mod config;
mod database;
mod entities;
mod http;
mod models;
mod polls;
mod session;
mod state;
mod templates;
mod voting;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::session::SessionStore;
use crate::state::AppState;
use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = AppConfig::load().context("Failed to load configuration")?;
    let database = database::connect(&config.database).await?;
    database::run_migrations(&database).await?;

    let sessions = Arc::new(SessionStore::new(&config.session));
    let app_state = AppState::new(database, sessions);

    let listener = TcpListener::bind(config.server.address())
        .await
        .context("Failed to bind HTTP listener")?;
    let local_addr = listener
        .local_addr()
        .context("Failed to obtain listener address")?;
    info!("QuickPoll listening on {local_addr}");

    let router: Router = http::router(app_state);
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server exited with error")?;

    info!("QuickPoll stopped");
    Ok(())
}

fn init_tracing() {
    let default_filter = "info,sqlx=warn";
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());
    assert!(!filter.is_empty(), "Tracing filter must not be empty");
    assert!(filter.len() < 256, "Tracing filter length exceeds bounds");

    let json = std::env::var("POLLS_LOG_FORMAT").is_ok_and(|format| format == "json");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
        return;
    }
    info!("Shutdown signal received");
}
