//! Message bindings: one live platform message per (session, destination).
//!
//! A binding ties a session's rendered transcript to a concrete message
//! (Telegram message_id or Slack ts) at a destination, with a TTL and an
//! expiry flag. Expired bindings linger so late updates can still find them,
//! and are reaped once expired for more than 24 hours.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::platform::DestinationKind;
use crate::render::Preset;
use crate::util::unix_now;

/// Default binding TTL in seconds.
pub const DEFAULT_TTL_SECONDS: u64 = 30;
/// TTL cap in seconds.
pub const MAX_TTL_SECONDS: u64 = 300;
/// How long an expired binding survives before reaping.
pub const REAP_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Binding between a session, preset, destination and platform message.
#[derive(Debug, Clone)]
pub struct MessageBinding {
    pub session_id: String,
    pub preset: Preset,
    pub kind: DestinationKind,
    /// chat_id[:thread_id] for Telegram, channel for Slack.
    pub identifier: String,
    /// Telegram message_id or Slack ts.
    pub message_id: String,
    /// Content most recently accepted by the platform.
    pub last_content: String,
    /// Unix seconds of creation.
    pub created_at: u64,
    pub ttl_seconds: u64,
    /// Set when explicitly expired; records the moment for reaping.
    pub expired_at: Option<u64>,
}

impl MessageBinding {
    pub fn new(
        session_id: &str,
        preset: Preset,
        kind: DestinationKind,
        identifier: &str,
        message_id: &str,
        last_content: String,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            preset,
            kind,
            identifier: identifier.to_string(),
            message_id: message_id.to_string(),
            last_content,
            created_at: unix_now(),
            ttl_seconds: DEFAULT_TTL_SECONDS,
            expired_at: None,
        }
    }

    /// Unix seconds at which this binding expires (or expired).
    fn expiry_moment(&self) -> u64 {
        self.expired_at
            .unwrap_or(self.created_at + self.ttl_seconds)
    }

    pub fn is_expired(&self) -> bool {
        self.expired_at.is_some() || unix_now() > self.created_at + self.ttl_seconds
    }

    /// Extend the TTL by `seconds`, capped at [`MAX_TTL_SECONDS`]; clears an
    /// explicit expiry.
    pub fn extend_ttl(&mut self, seconds: u64) {
        self.ttl_seconds = (self.ttl_seconds + seconds).min(MAX_TTL_SECONDS);
        self.expired_at = None;
    }

    pub fn mark_expired(&mut self) {
        if self.expired_at.is_none() {
            self.expired_at = Some(unix_now());
        }
    }

    /// Seconds until expiry, or 0 when already expired.
    pub fn time_remaining(&self) -> u64 {
        if self.expired_at.is_some() {
            return 0;
        }
        (self.created_at + self.ttl_seconds).saturating_sub(unix_now())
    }
}

/// All bindings, keyed by session. Cloneable — clones share state.
#[derive(Clone, Default)]
pub struct BindingSet {
    inner: Arc<Mutex<HashMap<String, Vec<MessageBinding>>>>,
}

impl BindingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, binding: MessageBinding) {
        let mut inner = self.inner.lock().await;
        inner
            .entry(binding.session_id.clone())
            .or_default()
            .push(binding);
    }

    /// Remove the binding for a (session, destination); returns it if found.
    pub async fn remove(
        &self,
        session_id: &str,
        kind: DestinationKind,
        identifier: &str,
    ) -> Option<MessageBinding> {
        let mut inner = self.inner.lock().await;
        let list = inner.get_mut(session_id)?;
        let pos = list
            .iter()
            .position(|b| b.kind == kind && b.identifier == identifier)?;
        let removed = list.remove(pos);
        if list.is_empty() {
            inner.remove(session_id);
        }
        Some(removed)
    }

    pub async fn for_session(&self, session_id: &str) -> Vec<MessageBinding> {
        let inner = self.inner.lock().await;
        inner.get(session_id).cloned().unwrap_or_default()
    }

    pub async fn find(
        &self,
        session_id: &str,
        kind: DestinationKind,
        identifier: &str,
    ) -> Option<MessageBinding> {
        let inner = self.inner.lock().await;
        inner
            .get(session_id)?
            .iter()
            .find(|b| b.kind == kind && b.identifier == identifier)
            .cloned()
    }

    /// Find the binding for a specific platform message (used by inbound
    /// interaction callbacks).
    pub async fn find_by_message(
        &self,
        kind: DestinationKind,
        identifier: &str,
        message_id: &str,
    ) -> Option<MessageBinding> {
        let inner = self.inner.lock().await;
        inner.values().flatten().find_map(|b| {
            (b.kind == kind && b.identifier == identifier && b.message_id == message_id)
                .then(|| b.clone())
        })
    }

    pub async fn update_last_content(
        &self,
        session_id: &str,
        kind: DestinationKind,
        identifier: &str,
        content: &str,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(binding) = inner
            .get_mut(session_id)
            .and_then(|list| list.iter_mut().find(|b| b.kind == kind && b.identifier == identifier))
        {
            binding.last_content = content.to_string();
        }
    }

    /// Swap in a new message id after a lost message was re-sent.
    pub async fn replace_message_id(
        &self,
        session_id: &str,
        kind: DestinationKind,
        identifier: &str,
        message_id: &str,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(binding) = inner
            .get_mut(session_id)
            .and_then(|list| list.iter_mut().find(|b| b.kind == kind && b.identifier == identifier))
        {
            binding.message_id = message_id.to_string();
        }
    }

    pub async fn has_bindings(&self, session_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.get(session_id).is_some_and(|list| !list.is_empty())
    }

    pub async fn sessions_with_bindings(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Remove and return all bindings of a session.
    pub async fn clear_session(&self, session_id: &str) -> Vec<MessageBinding> {
        let mut inner = self.inner.lock().await;
        inner.remove(session_id).unwrap_or_default()
    }

    /// Drop bindings that have been expired for longer than [`REAP_AFTER`].
    /// Returns the reaped bindings so callers can clear debouncer state.
    pub async fn reap_expired(&self) -> Vec<MessageBinding> {
        let now = unix_now();
        let cutoff = REAP_AFTER.as_secs();
        let mut reaped = Vec::new();

        let mut inner = self.inner.lock().await;
        inner.retain(|session_id, list| {
            list.retain(|b| {
                let stale = b.is_expired() && now.saturating_sub(b.expiry_moment()) > cutoff;
                if stale {
                    debug!(
                        "reaping expired binding {}:{} of {session_id}",
                        b.kind.as_str(),
                        b.identifier
                    );
                    reaped.push(b.clone());
                }
                !stale
            });
            !list.is_empty()
        });
        reaped
    }
}
