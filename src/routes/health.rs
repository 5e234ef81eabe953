//! Health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

fn bot_status(configured: bool) -> &'static str {
    if configured {
        "configured"
    } else {
        "not_configured"
    }
}

/// `GET /health` — liveness probe.
///
/// Returns status, uptime, watched session count and bot credential states.
/// Suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let service = &state.service;
    Json(json!({
        "status": "healthy",
        "uptime_seconds": service.uptime_seconds(),
        "sessions_watched": service.sessions_watched().await,
        "bots": {
            "TG": bot_status(service.telegram_configured()),
            "SL": bot_status(service.slack_configured()),
        },
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
