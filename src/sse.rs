//! Per-session SSE subscriber hub with replay and backpressure.
//!
//! Every subscriber owns a bounded channel drained by its HTTP response
//! stream. `connect` replays buffered events newer than the client's
//! `Last-Event-ID` and then registers the subscriber for live broadcast.
//! Subscribers that fall behind (full channel) or disconnect are dropped —
//! the hub never stalls upstream on a slow client.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::buffer::EventBuffers;
use crate::events::Event;

/// Outbound frames buffered per subscriber before it is considered too slow.
const SUBSCRIBER_QUEUE: usize = 256;

/// Why a session's event stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unwatched,
    FileDeleted,
    NoDestinations,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unwatched => "unwatched",
            Self::FileDeleted => "file_deleted",
            Self::NoDestinations => "no_destinations",
            Self::Shutdown => "shutdown",
        }
    }
}

/// One event-stream frame: `id:` / `event:` / `data:` terminated by a blank
/// line on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub id: String,
    pub event: String,
    pub data: String,
}

impl SseFrame {
    pub fn new(event_id: &str, event: &Event) -> Self {
        Self {
            id: event_id.to_string(),
            event: event.tag().to_string(),
            data: serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()),
        }
    }

    fn session_ended(reason: CloseReason) -> Self {
        Self {
            id: String::new(),
            event: "session_ended".to_string(),
            data: json!({ "reason": reason.as_str() }).to_string(),
        }
    }

    /// Wire form, mostly useful for tests and debugging; the HTTP layer
    /// frames through axum's SSE response type.
    pub fn to_wire(&self) -> String {
        format!(
            "id:{}\nevent:{}\ndata:{}\n\n",
            self.id, self.event, self.data
        )
    }
}

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<SseFrame>,
}

/// Per-session subscriber sets.
///
/// Cloneable — all clones share the same registry.
#[derive(Clone)]
pub struct SseHub {
    subscribers: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
    buffers: EventBuffers,
}

impl SseHub {
    pub fn new(buffers: EventBuffers) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            buffers,
        }
    }

    /// Register a subscriber. Replayed frames (everything newer than
    /// `last_event_id`) are pushed into the returned channel ahead of live
    /// broadcast; registration and the replay snapshot are atomic so no
    /// event is missed or duplicated in between.
    pub async fn connect(
        &self,
        session_id: &str,
        last_event_id: Option<&str>,
    ) -> mpsc::Receiver<SseFrame> {
        let replay = self.buffers.get_since(session_id, last_event_id).await;
        // Leave room for the replay burst on top of the live queue.
        let (tx, rx) = mpsc::channel(replay.len() + SUBSCRIBER_QUEUE);

        let mut subscribers = self.subscribers.write().await;
        for entry in &replay {
            let frame = SseFrame::new(&entry.event_id(), &entry.event);
            // Capacity is sized for the replay; a failure means the client
            // is already gone.
            if tx.try_send(frame).is_err() {
                break;
            }
        }
        let id = Uuid::new_v4();
        subscribers
            .entry(session_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        debug!(
            "sse subscriber {id} connected to {session_id} ({} replayed)",
            replay.len()
        );
        rx
    }

    /// Broadcast one event to every subscriber of a session, dropping any
    /// whose queue is full or closed.
    pub async fn broadcast(&self, session_id: &str, event_id: &str, event: &Event) {
        let frame = SseFrame::new(event_id, event);
        let mut subscribers = self.subscribers.write().await;
        if let Some(list) = subscribers.get_mut(session_id) {
            list.retain(|sub| match sub.tx.try_send(frame.clone()) {
                Ok(()) => true,
                Err(_) => {
                    debug!("dropping slow/closed sse subscriber {}", sub.id);
                    false
                }
            });
        }
    }

    /// Broadcast a terminal `session_ended` frame, then disconnect all
    /// subscribers of the session.
    pub async fn close_session(&self, session_id: &str, reason: CloseReason) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(list) = subscribers.remove(session_id) {
            if !list.is_empty() {
                info!(
                    "closing {} sse subscriber(s) of {session_id}: {}",
                    list.len(),
                    reason.as_str()
                );
            }
            let frame = SseFrame::session_ended(reason);
            for sub in list {
                let _ = sub.tx.try_send(frame.clone());
                // Dropping the sender ends the subscriber's stream.
            }
        }
    }

    /// Number of live subscribers for a session.
    pub async fn client_count(&self, session_id: &str) -> usize {
        let subscribers = self.subscribers.read().await;
        subscribers.get(session_id).map_or(0, Vec::len)
    }

    /// Sessions that currently have at least one subscriber.
    pub async fn active_sessions(&self) -> Vec<String> {
        let subscribers = self.subscribers.read().await;
        subscribers
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }
}
