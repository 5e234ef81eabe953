//! Per-binding update coalescing with content-equality suppression.
//!
//! Rapid event bursts would otherwise hammer platform rate limits (Telegram
//! ~30 msg/s per chat, Slack ~1 req/s per channel — both targeted at half).
//! Each `(platform, identifier, message_id)` key holds at most one pending
//! timer; rescheduling cancels and replaces it with the latest content.
//! Content identical to the last successfully pushed string is skipped
//! without arming a timer at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::platform::DestinationKind;

/// Default debounce delay for Telegram updates.
pub const TELEGRAM_DELAY: Duration = Duration::from_millis(500);
/// Default debounce delay for Slack updates.
pub const SLACK_DELAY: Duration = Duration::from_millis(2000);

/// Key identifying one live message at one destination.
pub type BindingKey = (DestinationKind, String, String);

/// Content snapshot handed to [`Debouncer::schedule`].
///
/// Text payloads participate in equality suppression; opaque payloads are
/// coalesced but never suppressed.
#[derive(Debug, Clone)]
pub enum Payload {
    Text(String),
    Opaque,
}

/// What `schedule` did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled,
    /// Identical to the last pushed content; nothing armed.
    Skipped,
}

/// Delivery closure: performs the platform call, returns whether it was
/// accepted.
pub type UpdateFn = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

struct Pending {
    handle: tokio::task::JoinHandle<()>,
    update_fn: UpdateFn,
    content: Payload,
}

#[derive(Default)]
struct DebounceInner {
    pending: HashMap<BindingKey, Pending>,
    last_pushed: HashMap<BindingKey, String>,
    /// Per-key delivery locks so two fires for the same binding never run
    /// concurrently.
    delivery_locks: HashMap<BindingKey, Arc<Mutex<()>>>,
}

impl DebounceInner {
    fn delivery_lock(&mut self, key: &BindingKey) -> Arc<Mutex<()>> {
        self.delivery_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Debounces message updates per binding. Cloneable — clones share state.
#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<Mutex<DebounceInner>>,
    telegram_delay: Duration,
    slack_delay: Duration,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(TELEGRAM_DELAY, SLACK_DELAY)
    }
}

impl Debouncer {
    pub fn new(telegram_delay: Duration, slack_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DebounceInner::default())),
            telegram_delay,
            slack_delay,
        }
    }

    fn delay_for(&self, kind: DestinationKind) -> Duration {
        match kind {
            DestinationKind::Telegram => self.telegram_delay,
            DestinationKind::Slack => self.slack_delay,
        }
    }

    /// Schedule a debounced delivery of `content` through `update_fn`.
    ///
    /// An already-pending timer for the key is cancelled and replaced. If
    /// `content` equals the last successfully pushed text for the key, the
    /// request is dropped and no timer is armed.
    pub async fn schedule(
        &self,
        kind: DestinationKind,
        identifier: &str,
        message_id: &str,
        update_fn: UpdateFn,
        content: Payload,
    ) -> ScheduleOutcome {
        let key: BindingKey = (kind, identifier.to_string(), message_id.to_string());

        let delivery_lock;
        {
            let mut inner = self.inner.lock().await;

            if let Payload::Text(ref text) = content {
                if inner.last_pushed.get(&key) == Some(text) {
                    debug!(
                        "skipped update for {}/{identifier}/{message_id}: content unchanged",
                        kind.as_str()
                    );
                    return ScheduleOutcome::Skipped;
                }
            }

            if let Some(old) = inner.pending.remove(&key) {
                old.handle.abort();
            }

            delivery_lock = inner.delivery_lock(&key);
        }

        let delay = self.delay_for(kind);
        let debouncer = self.clone();
        let task_key = key.clone();
        let task_fn = update_fn.clone();
        let task_content = content.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debouncer
                .fire(&task_key, &delivery_lock, &task_fn, task_content)
                .await;
        });

        let mut inner = self.inner.lock().await;
        inner.pending.insert(
            key,
            Pending {
                handle,
                update_fn,
                content,
            },
        );
        ScheduleOutcome::Scheduled
    }

    /// Run one delivery: remove the pending entry, invoke the closure under
    /// the key's delivery lock, record last-pushed on success.
    async fn fire(
        &self,
        key: &BindingKey,
        delivery_lock: &Arc<Mutex<()>>,
        update_fn: &UpdateFn,
        content: Payload,
    ) {
        {
            let mut inner = self.inner.lock().await;
            inner.pending.remove(key);
        }

        let _guard = delivery_lock.lock().await;
        let accepted = update_fn().await;
        if accepted {
            if let Payload::Text(text) = content {
                let mut inner = self.inner.lock().await;
                inner.last_pushed.insert(key.clone(), text);
            }
        } else {
            warn!(
                "update for {}/{}/{} failed, binding stays eligible",
                key.0.as_str(),
                key.1,
                key.2
            );
        }
    }

    /// Fire all pending updates now, skipping their remaining delay.
    pub async fn flush(&self) {
        let mut drained = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let keys: Vec<BindingKey> = inner.pending.keys().cloned().collect();
            for key in keys {
                if let Some(pending) = inner.pending.remove(&key) {
                    pending.handle.abort();
                    let lock = inner.delivery_lock(&key);
                    drained.push((key, pending.update_fn, pending.content, lock));
                }
            }
        }

        for (key, update_fn, content, lock) in drained {
            self.fire(&key, &lock, &update_fn, content).await;
        }
    }

    /// Drop all pending timers without firing them.
    pub async fn cancel_all(&self) {
        let mut inner = self.inner.lock().await;
        for (_, pending) in inner.pending.drain() {
            pending.handle.abort();
        }
    }

    /// Forget all state for a removed binding.
    pub async fn clear_content(&self, kind: DestinationKind, identifier: &str, message_id: &str) {
        let key: BindingKey = (kind, identifier.to_string(), message_id.to_string());
        let mut inner = self.inner.lock().await;
        if let Some(pending) = inner.pending.remove(&key) {
            pending.handle.abort();
        }
        inner.last_pushed.remove(&key);
        inner.delivery_locks.remove(&key);
    }

    /// Count of pending timers.
    pub async fn pending_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.pending.len()
    }

    /// Whether a timer is pending for a key.
    pub async fn has_pending(
        &self,
        kind: DestinationKind,
        identifier: &str,
        message_id: &str,
    ) -> bool {
        let inner = self.inner.lock().await;
        inner
            .pending
            .contains_key(&(kind, identifier.to_string(), message_id.to_string()))
    }

    /// Last successfully pushed text for a key (for tests and debugging).
    pub async fn last_pushed(
        &self,
        kind: DestinationKind,
        identifier: &str,
        message_id: &str,
    ) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .last_pushed
            .get(&(kind, identifier.to_string(), message_id.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_fn(counter: Arc<AtomicUsize>) -> UpdateFn {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
        })
    }

    fn failing_fn() -> UpdateFn {
        Arc::new(|| Box::pin(async { false }))
    }

    fn fast() -> Debouncer {
        Debouncer::new(Duration::from_millis(20), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_burst_coalesces_to_one_delivery() {
        let debouncer = fast();
        let count = Arc::new(AtomicUsize::new(0));

        for i in 0..10 {
            let outcome = debouncer
                .schedule(
                    DestinationKind::Telegram,
                    "chat",
                    "msg",
                    counting_fn(count.clone()),
                    Payload::Text(format!("content {i}")),
                )
                .await;
            assert_eq!(outcome, ScheduleOutcome::Scheduled);
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(debouncer.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_identical_content_is_skipped_after_push() {
        let debouncer = fast();
        let count = Arc::new(AtomicUsize::new(0));

        debouncer
            .schedule(
                DestinationKind::Telegram,
                "chat",
                "msg",
                counting_fn(count.clone()),
                Payload::Text("same".into()),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let outcome = debouncer
            .schedule(
                DestinationKind::Telegram,
                "chat",
                "msg",
                counting_fn(count.clone()),
                Payload::Text("same".into()),
            )
            .await;
        assert_eq!(outcome, ScheduleOutcome::Skipped);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_binding_eligible() {
        let debouncer = fast();
        debouncer
            .schedule(
                DestinationKind::Slack,
                "C1",
                "ts1",
                failing_fn(),
                Payload::Text("v1".into()),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Failure did not record last-pushed, so the same content schedules
        // again.
        assert!(debouncer
            .last_pushed(DestinationKind::Slack, "C1", "ts1")
            .await
            .is_none());
        let outcome = debouncer
            .schedule(
                DestinationKind::Slack,
                "C1",
                "ts1",
                failing_fn(),
                Payload::Text("v1".into()),
            )
            .await;
        assert_eq!(outcome, ScheduleOutcome::Scheduled);
        debouncer.cancel_all().await;
    }

    #[tokio::test]
    async fn test_opaque_payload_disables_suppression() {
        let debouncer = fast();
        let count = Arc::new(AtomicUsize::new(0));

        debouncer
            .schedule(
                DestinationKind::Telegram,
                "chat",
                "msg",
                counting_fn(count.clone()),
                Payload::Opaque,
            )
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let outcome = debouncer
            .schedule(
                DestinationKind::Telegram,
                "chat",
                "msg",
                counting_fn(count.clone()),
                Payload::Opaque,
            )
            .await;
        assert_eq!(outcome, ScheduleOutcome::Scheduled);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_flush_fires_immediately() {
        let debouncer = Debouncer::new(Duration::from_secs(60), Duration::from_secs(60));
        let count = Arc::new(AtomicUsize::new(0));

        debouncer
            .schedule(
                DestinationKind::Telegram,
                "chat",
                "msg",
                counting_fn(count.clone()),
                Payload::Text("v1".into()),
            )
            .await;
        assert_eq!(debouncer.pending_count().await, 1);

        debouncer.flush().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(debouncer.pending_count().await, 0);
        assert_eq!(
            debouncer
                .last_pushed(DestinationKind::Telegram, "chat", "msg")
                .await
                .as_deref(),
            Some("v1")
        );
    }

    #[tokio::test]
    async fn test_cancel_all_drops_without_firing() {
        let debouncer = Debouncer::new(Duration::from_secs(60), Duration::from_secs(60));
        let count = Arc::new(AtomicUsize::new(0));

        debouncer
            .schedule(
                DestinationKind::Telegram,
                "chat",
                "msg",
                counting_fn(count.clone()),
                Payload::Text("v1".into()),
            )
            .await;
        debouncer.cancel_all().await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(debouncer.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_clear_content_forgets_suppression() {
        let debouncer = fast();
        let count = Arc::new(AtomicUsize::new(0));

        debouncer
            .schedule(
                DestinationKind::Telegram,
                "chat",
                "msg",
                counting_fn(count.clone()),
                Payload::Text("v1".into()),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        debouncer
            .clear_content(DestinationKind::Telegram, "chat", "msg")
            .await;

        // Same content schedules again after the binding was cleared.
        let outcome = debouncer
            .schedule(
                DestinationKind::Telegram,
                "chat",
                "msg",
                counting_fn(count.clone()),
                Payload::Text("v1".into()),
            )
            .await;
        assert_eq!(outcome, ScheduleOutcome::Scheduled);
        debouncer.cancel_all().await;
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_interfere() {
        let debouncer = fast();
        let count = Arc::new(AtomicUsize::new(0));

        debouncer
            .schedule(
                DestinationKind::Telegram,
                "chat",
                "msg1",
                counting_fn(count.clone()),
                Payload::Text("a".into()),
            )
            .await;
        debouncer
            .schedule(
                DestinationKind::Telegram,
                "chat",
                "msg2",
                counting_fn(count.clone()),
                Payload::Text("a".into()),
            )
            .await;

        assert_eq!(debouncer.pending_count().await, 2);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
