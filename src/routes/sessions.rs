//! Session listing endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /sessions` — list all watched sessions with their destinations and
/// live SSE client counts.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let summaries = state.service.list_sessions().await;
    let sessions: Vec<Value> = summaries
        .iter()
        .map(|s| {
            let telegram: Vec<Value> = s
                .destinations
                .telegram
                .iter()
                .map(|d| {
                    let mut obj = json!({"chat_id": d.chat_id});
                    if let Some(thread_id) = d.thread_id {
                        obj["thread_id"] = json!(thread_id);
                    }
                    obj
                })
                .collect();
            let slack: Vec<Value> = s
                .destinations
                .slack
                .iter()
                .map(|d| json!({"channel": d.channel}))
                .collect();
            json!({
                "session_id": s.session_id,
                "path": s.path,
                "destinations": {"TG": telegram, "SL": slack},
                "sse_clients": s.sse_clients,
            })
        })
        .collect();

    Json(json!({ "sessions": sessions }))
}
