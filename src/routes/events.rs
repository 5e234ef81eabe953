//! Server-Sent Events (SSE) endpoint.
//!
//! `GET /sessions/{id}/events` — per-session event stream. A client may send
//! `Last-Event-ID` to resume: everything newer is replayed before live
//! events. The stream ends with a terminal `session_ended` frame when the
//! session goes away.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::sse::SseFrame;
use crate::AppState;

fn to_sse_event(frame: &SseFrame) -> Event {
    let mut event = Event::default().event(&frame.event).data(&frame.data);
    if !frame.id.is_empty() {
        event = event.id(&frame.id);
    }
    event
}

/// `GET /sessions/{id}/events` — SSE stream for one session.
pub async fn session_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !state.service.session_known(&session_id).await {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown session: {session_id}")})),
        ));
    }

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let rx = state
        .service
        .subscribe(&session_id, last_event_id.as_deref())
        .await;

    // The stream ends when the hub drops the subscriber's sender
    // (session_ended or backpressure disconnect).
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, std::convert::Infallible>(to_sse_event(&frame)), rx))
    });

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default().interval(std::time::Duration::from_secs(15))))
}
