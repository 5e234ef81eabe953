#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tailcast
//!
//! Watcher service for append-only session transcript files.
//!
//! tailcast tails JSONL session transcripts, derives semantic events, and
//! streams live updates to Telegram chats (with optional topic threads),
//! Slack channels (Block Kit layout), and raw SSE subscribers — keeping
//! exactly one live message per (session, destination) under per-platform
//! rate limits.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use tailcast::{routes, AppState, WatcherService};

/// Maximum concurrent HTTP connections.
const MAX_CONNECTIONS: usize = 64;

/// Watcher service for append-only session transcript files.
#[derive(Parser)]
#[command(name = "tailcast", version)]
struct Cli {
    /// Host to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind to.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Directory for per-session checkpoint files.
    #[arg(long, default_value = "state")]
    state_dir: PathBuf,

    /// Log level.
    #[arg(long, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"])]
    log_level: String,
}

/// Map the CLI log level to a tracing filter directive.
fn filter_for(level: &str) -> &'static str {
    match level {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" => "error",
        "CRITICAL" => "error",
        _ => "info",
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| filter_for(&cli.log_level).to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    std::process::exit(run_server(cli).await);
}

async fn run_server(cli: Cli) -> i32 {
    info!("tailcast v{} starting", env!("CARGO_PKG_VERSION"));
    info!("config path: {}", cli.config.display());
    info!("state directory: {}", cli.state_dir.display());

    let service = match WatcherService::new(cli.config.clone(), cli.state_dir.clone()) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("config error: {e}");
            return 1;
        }
    };

    if let Err(e) = service.start().await {
        error!("failed to start watcher service: {e}");
        return 1;
    }

    let state = AppState::new(Arc::clone(&service));

    let app = Router::new()
        .route("/attach", post(routes::attach::attach))
        .route("/detach", post(routes::attach::detach))
        .route("/sessions", get(routes::sessions::list_sessions))
        .route("/sessions/{id}/events", get(routes::events::session_events))
        .route("/health", get(routes::health::health))
        .route("/slack/commands", post(routes::webhooks::slack_command))
        .route(
            "/slack/interactions",
            post(routes::webhooks::slack_interaction),
        )
        .route(
            "/telegram/webhook",
            post(routes::webhooks::telegram_webhook),
        )
        .with_state(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(MAX_CONNECTIONS));

    let listener = match TcpListener::bind((cli.host.as_str(), cli.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}:{}: {e}", cli.host, cli.port);
            return 1;
        }
    };
    info!("listening on http://{}:{}", cli.host, cli.port);

    // Graceful shutdown on SIGINT/SIGTERM.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT");
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("server error: {e}");
        return 1;
    }

    // HTTP ingress is stopped; drain and persist.
    info!("shutting down...");
    service.stop().await;
    info!("goodbye");
    0
}
