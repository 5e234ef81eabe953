//! Runtime destination registry with keep-alive on last detach.
//!
//! Tracks which messaging destinations are attached to each session. The
//! Telegram runtime identifier is the compound `chat_id[:thread_id]` string,
//! so two attachments to the same chat but different topics are distinct.
//!
//! When the last destination of a session detaches, a keep-alive timer is
//! armed; if nothing re-attaches before it fires, the session id is sent on
//! the expiry channel and the orchestrator tears the session down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::platform::DestinationKind;
use crate::util::unix_now;

/// Grace period between the last detach and session teardown.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Build the compound Telegram runtime identifier.
pub fn make_telegram_identifier(chat_id: &str, thread_id: Option<i64>) -> String {
    match thread_id {
        Some(thread_id) => format!("{chat_id}:{thread_id}"),
        None => chat_id.to_string(),
    }
}

/// Split a compound Telegram identifier into `(chat_id, thread_id)`.
///
/// `chat_id` may itself be negative (and so contain a leading `-`), so the
/// split is on the *rightmost* colon and only when the suffix parses as an
/// integer; otherwise the whole string is the chat id.
pub fn parse_telegram_identifier(identifier: &str) -> (String, Option<i64>) {
    if let Some((chat_id, suffix)) = identifier.rsplit_once(':') {
        if let Ok(thread_id) = suffix.parse::<i64>() {
            return (chat_id.to_string(), Some(thread_id));
        }
    }
    (identifier.to_string(), None)
}

/// Persisted destination entries fed to [`DestinationRegistry::restore`]:
/// each session with its (kind, identifier) pairs.
pub type RestoredDestinations = Vec<(String, Vec<(DestinationKind, String)>)>;

/// One destination currently attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachedDestination {
    pub kind: DestinationKind,
    /// chat_id[:thread_id] for Telegram, channel for Slack.
    pub identifier: String,
    /// Unix seconds of attachment.
    pub attached_at: u64,
}

/// Result of an attach call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachResult {
    /// False when the same (kind, identifier) was already attached.
    pub added: bool,
    /// True when this is the session's first destination.
    pub first: bool,
}

#[derive(Default)]
struct RegistryInner {
    attached: HashMap<String, Vec<AttachedDestination>>,
    keep_alive_timers: HashMap<String, tokio::task::JoinHandle<()>>,
}

/// In-memory index `session_id → [AttachedDestination]` plus keep-alive
/// timers. Cloneable — clones share state. Persistence is the caller's
/// concern (the orchestrator writes through the config manager).
#[derive(Clone)]
pub struct DestinationRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    keep_alive: Duration,
    expiry_tx: mpsc::Sender<String>,
}

impl DestinationRegistry {
    /// `expiry_tx` receives session ids whose keep-alive elapsed with zero
    /// destinations still attached.
    pub fn new(keep_alive: Duration, expiry_tx: mpsc::Sender<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            keep_alive,
            expiry_tx,
        }
    }

    /// Attach a destination. Idempotent: a duplicate (kind, identifier)
    /// leaves state untouched and reports `added: false`. Any pending
    /// keep-alive timer for the session is cancelled either way.
    pub async fn attach(
        &self,
        session_id: &str,
        kind: DestinationKind,
        identifier: &str,
    ) -> AttachResult {
        let mut inner = self.inner.lock().await;

        if let Some(timer) = inner.keep_alive_timers.remove(session_id) {
            timer.abort();
            debug!("cancelled keep-alive for {session_id} on re-attach");
        }

        let list = inner.attached.entry(session_id.to_string()).or_default();
        if list
            .iter()
            .any(|d| d.kind == kind && d.identifier == identifier)
        {
            return AttachResult {
                added: false,
                first: false,
            };
        }

        let first = list.is_empty();
        list.push(AttachedDestination {
            kind,
            identifier: identifier.to_string(),
            attached_at: unix_now(),
        });
        info!(
            "attached {}:{identifier} to {session_id}{}",
            kind.as_str(),
            if first { " (first destination)" } else { "" }
        );
        AttachResult { added: true, first }
    }

    /// Detach a destination. Returns false when it was not attached. When
    /// the last destination goes, the keep-alive timer is armed.
    pub async fn detach(
        &self,
        session_id: &str,
        kind: DestinationKind,
        identifier: &str,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(list) = inner.attached.get_mut(session_id) else {
            return false;
        };

        let before = list.len();
        list.retain(|d| !(d.kind == kind && d.identifier == identifier));
        if list.len() == before {
            return false;
        }

        if list.is_empty() {
            inner.attached.remove(session_id);
            self.arm_keep_alive(&mut inner, session_id);
        }
        info!("detached {}:{identifier} from {session_id}", kind.as_str());
        true
    }

    fn arm_keep_alive(&self, inner: &mut RegistryInner, session_id: &str) {
        if let Some(old) = inner.keep_alive_timers.remove(session_id) {
            old.abort();
        }

        let registry = self.clone();
        let session = session_id.to_string();
        let delay = self.keep_alive;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut inner = registry.inner.lock().await;
            inner.keep_alive_timers.remove(&session);
            let still_empty = inner
                .attached
                .get(&session)
                .is_none_or(|list| list.is_empty());
            drop(inner);
            if still_empty {
                info!("keep-alive expired for {session}");
                let _ = registry.expiry_tx.send(session).await;
            }
        });
        inner
            .keep_alive_timers
            .insert(session_id.to_string(), handle);
        debug!("armed keep-alive ({:?}) for {session_id}", self.keep_alive);
    }

    /// Re-populate runtime state from persisted entries. Returns the
    /// sessions that got at least one destination (the caller emits one
    /// session-start per entry).
    pub async fn restore(&self, entries: RestoredDestinations) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        let mut started = Vec::new();
        for (session_id, destinations) in entries {
            if destinations.is_empty() {
                continue;
            }
            let list = inner.attached.entry(session_id.clone()).or_default();
            for (kind, identifier) in destinations {
                if !list
                    .iter()
                    .any(|d| d.kind == kind && d.identifier == identifier)
                {
                    list.push(AttachedDestination {
                        kind,
                        identifier,
                        attached_at: unix_now(),
                    });
                }
            }
            if !list.is_empty() {
                started.push(session_id);
            }
        }
        started
    }

    /// Cancel every keep-alive timer without firing.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        for (_, timer) in inner.keep_alive_timers.drain() {
            timer.abort();
        }
    }

    /// Drop all runtime state for a session, including its timer.
    pub async fn clear_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.attached.remove(session_id);
        if let Some(timer) = inner.keep_alive_timers.remove(session_id) {
            timer.abort();
        }
    }

    pub async fn get(&self, session_id: &str) -> Vec<AttachedDestination> {
        let inner = self.inner.lock().await;
        inner.attached.get(session_id).cloned().unwrap_or_default()
    }

    pub async fn has_destinations(&self, session_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .attached
            .get(session_id)
            .is_some_and(|list| !list.is_empty())
    }

    pub async fn session_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.attached.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(keep_alive_ms: u64) -> (DestinationRegistry, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        (
            DestinationRegistry::new(Duration::from_millis(keep_alive_ms), tx),
            rx,
        )
    }

    #[test]
    fn test_identifier_round_trip() {
        let id = make_telegram_identifier("-1001234567890", Some(123));
        assert_eq!(id, "-1001234567890:123");
        assert_eq!(
            parse_telegram_identifier(&id),
            ("-1001234567890".to_string(), Some(123))
        );
    }

    #[test]
    fn test_identifier_without_thread() {
        assert_eq!(make_telegram_identifier("42", None), "42");
        assert_eq!(parse_telegram_identifier("42"), ("42".to_string(), None));
        assert_eq!(
            parse_telegram_identifier("-1001234567890"),
            ("-1001234567890".to_string(), None)
        );
    }

    #[test]
    fn test_identifier_invalid_suffix_is_chat_id() {
        assert_eq!(
            parse_telegram_identifier("123:abc"),
            ("123:abc".to_string(), None)
        );
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let (registry, _rx) = registry(50);
        let first = registry
            .attach("s", DestinationKind::Telegram, "42")
            .await;
        assert!(first.added && first.first);

        let dup = registry
            .attach("s", DestinationKind::Telegram, "42")
            .await;
        assert!(!dup.added && !dup.first);
        assert_eq!(registry.get("s").await.len(), 1);
    }

    #[tokio::test]
    async fn test_same_chat_different_threads_are_distinct() {
        let (registry, _rx) = registry(50);
        registry.attach("s", DestinationKind::Telegram, "-100").await;
        let second = registry
            .attach("s", DestinationKind::Telegram, "-100:9")
            .await;
        assert!(second.added && !second.first);
        assert_eq!(registry.get("s").await.len(), 2);
    }

    #[tokio::test]
    async fn test_detach_unknown_returns_false() {
        let (registry, _rx) = registry(50);
        assert!(!registry.detach("s", DestinationKind::Slack, "C1").await);
    }

    #[tokio::test]
    async fn test_last_detach_fires_keep_alive() {
        let (registry, mut rx) = registry(30);
        registry.attach("s", DestinationKind::Slack, "C1").await;
        assert!(registry.detach("s", DestinationKind::Slack, "C1").await);

        let expired = tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .expect("keep-alive should fire")
            .unwrap();
        assert_eq!(expired, "s");
    }

    #[tokio::test]
    async fn test_reattach_cancels_keep_alive() {
        let (registry, mut rx) = registry(50);
        registry.attach("s", DestinationKind::Slack, "C1").await;
        registry.detach("s", DestinationKind::Slack, "C1").await;
        // Quick re-attach before expiry.
        registry.attach("s", DestinationKind::Slack, "C1").await;

        let fired = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(fired.is_err(), "keep-alive must not fire after re-attach");
        assert!(registry.has_destinations("s").await);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_timers_without_firing() {
        let (registry, mut rx) = registry(30);
        registry.attach("s", DestinationKind::Slack, "C1").await;
        registry.detach("s", DestinationKind::Slack, "C1").await;
        registry.shutdown().await;

        let fired = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_restore_skips_empty_and_reports_started() {
        let (registry, _rx) = registry(50);
        let started = registry
            .restore(vec![
                (
                    "a".to_string(),
                    vec![(DestinationKind::Telegram, "42".to_string())],
                ),
                ("b".to_string(), vec![]),
                (
                    "c".to_string(),
                    vec![
                        (DestinationKind::Slack, "C1".to_string()),
                        (DestinationKind::Slack, "C2".to_string()),
                    ],
                ),
            ])
            .await;
        assert_eq!(started, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(registry.get("c").await.len(), 2);
        assert!(!registry.has_destinations("b").await);
    }
}
