//! Per-session bounded event rings with monotonic ids.
//!
//! [`EventBuffers`] stores the recent events for every session. When a ring is
//! full the oldest entries are evicted. Event ids are strings of the form
//! `evt_000042`; the numeric part is a per-session sequence that survives
//! restarts via the checkpoint, so ids issued after a restart are strictly
//! greater than any issued before it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::events::Event;

/// Maximum events retained per session.
pub const BUFFER_CAPACITY: usize = 4096;

/// A single buffered entry.
#[derive(Debug, Clone)]
pub struct BufferedEvent {
    seq: u64,
    pub event: Event,
}

impl BufferedEvent {
    pub fn event_id(&self) -> String {
        format_event_id(self.seq)
    }
}

fn format_event_id(seq: u64) -> String {
    format!("evt_{seq:06}")
}

/// Parse the numeric sequence out of an event id. Ids not produced by this
/// buffer parse as `None` (treated as "replay everything").
fn parse_event_id(id: &str) -> Option<u64> {
    id.strip_prefix("evt_")?.parse().ok()
}

struct SessionBuffer {
    entries: VecDeque<BufferedEvent>,
    next_seq: u64,
}

impl SessionBuffer {
    fn new(start_seq: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: start_seq,
        }
    }
}

/// Manages one bounded event ring per session.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone, Default)]
pub struct EventBuffers {
    sessions: Arc<RwLock<HashMap<String, SessionBuffer>>>,
}

impl EventBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a session's ring exists, seeding the sequence counter.
    ///
    /// Used on restore so ids continue strictly after the checkpointed
    /// `last_event_seq`. A no-op when the ring already exists.
    pub async fn ensure_session(&self, session_id: &str, start_seq: u64) {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionBuffer::new(start_seq.max(1)));
    }

    /// Append an event, assigning and returning its id.
    pub async fn add_event(&self, session_id: &str, event: Event) -> String {
        let mut sessions = self.sessions.write().await;
        let buffer = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionBuffer::new(1));

        let seq = buffer.next_seq;
        buffer.next_seq += 1;

        if buffer.entries.len() >= BUFFER_CAPACITY {
            buffer.entries.pop_front();
        }
        buffer.entries.push_back(BufferedEvent { seq, event });
        format_event_id(seq)
    }

    /// All events with id strictly greater than `since` (all events when
    /// `since` is `None` or unparseable), in append order.
    pub async fn get_since(&self, session_id: &str, since: Option<&str>) -> Vec<BufferedEvent> {
        let sessions = self.sessions.read().await;
        let Some(buffer) = sessions.get(session_id) else {
            return Vec::new();
        };
        let since_seq = since.and_then(parse_event_id).unwrap_or(0);
        buffer
            .entries
            .iter()
            .filter(|e| e.seq > since_seq)
            .cloned()
            .collect()
    }

    /// Just the events, without ids.
    pub async fn events(&self, session_id: &str) -> Vec<Event> {
        self.get_since(session_id, None)
            .await
            .into_iter()
            .map(|e| e.event)
            .collect()
    }

    /// Id of the most recent event, if any.
    pub async fn last_event_id(&self, session_id: &str) -> Option<String> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)?
            .entries
            .back()
            .map(BufferedEvent::event_id)
    }

    /// Sequence number of the most recent event ever assigned for a session
    /// (0 when none). Persisted into the checkpoint.
    pub async fn last_seq(&self, session_id: &str) -> u64 {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map_or(0, |b| b.next_seq - 1)
    }

    /// Sequence the next `n` events will end at, without appending. Lets the
    /// checkpoint be written before the events are actually buffered.
    pub async fn seq_after(&self, session_id: &str, n: usize) -> u64 {
        let sessions = self.sessions.read().await;
        let next = sessions.get(session_id).map_or(1, |b| b.next_seq);
        next + n as u64 - 1
    }

    /// Drop a session's ring entirely.
    pub async fn remove(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Block, BlockContent};

    fn user_event(text: &str) -> Event {
        Event::AddBlock {
            block: Block {
                id: format!("blk-{text}"),
                content: BlockContent::User { text: text.into() },
            },
        }
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_formatted() {
        let buffers = EventBuffers::new();
        let id1 = buffers.add_event("s", user_event("a")).await;
        let id2 = buffers.add_event("s", user_event("b")).await;
        assert_eq!(id1, "evt_000001");
        assert_eq!(id2, "evt_000002");
        assert!(id2 > id1);
    }

    #[tokio::test]
    async fn test_get_since_strictly_greater() {
        let buffers = EventBuffers::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(buffers.add_event("s", user_event(&i.to_string())).await);
        }

        let tail = buffers.get_since("s", Some(&ids[2])).await;
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].event_id(), ids[3]);
        assert_eq!(tail[1].event_id(), ids[4]);

        let all = buffers.get_since("s", None).await;
        assert_eq!(all.len(), 5);

        let none = buffers.get_since("s", Some(&ids[4])).await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_get_since_unknown_id_returns_all() {
        let buffers = EventBuffers::new();
        buffers.add_event("s", user_event("a")).await;
        let all = buffers.get_since("s", Some("garbage")).await;
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_ring_evicts_oldest() {
        let buffers = EventBuffers::new();
        for i in 0..(BUFFER_CAPACITY + 10) {
            buffers.add_event("s", user_event(&i.to_string())).await;
        }
        let all = buffers.get_since("s", None).await;
        assert_eq!(all.len(), BUFFER_CAPACITY);
        // Oldest surviving entry is the 11th ever appended.
        assert_eq!(all[0].event_id(), format!("evt_{:06}", 11));
    }

    #[tokio::test]
    async fn test_seeded_sequence_continues_after_restart() {
        let buffers = EventBuffers::new();
        buffers.ensure_session("s", 43).await;
        let id = buffers.add_event("s", user_event("a")).await;
        assert_eq!(id, "evt_000043");
        assert_eq!(buffers.last_seq("s").await, 43);
    }

    #[tokio::test]
    async fn test_seq_after_predicts_checkpoint_seq() {
        let buffers = EventBuffers::new();
        buffers.add_event("s", user_event("a")).await;
        assert_eq!(buffers.seq_after("s", 3).await, 4);
        assert_eq!(buffers.seq_after("fresh", 2).await, 2);
    }

    #[tokio::test]
    async fn test_remove_drops_ring() {
        let buffers = EventBuffers::new();
        buffers.add_event("s", user_event("a")).await;
        buffers.remove("s").await;
        assert!(buffers.get_since("s", None).await.is_empty());
        assert_eq!(buffers.last_seq("s").await, 0);
    }
}
