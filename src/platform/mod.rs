//! Messaging platform clients.
//!
//! Both platforms expose the same small capability set — `validate()`,
//! `send(...) → message handle`, `update(...) → bool` — and the orchestrator
//! dispatches on [`DestinationKind`]. Transient failures are retried once
//! with a short backoff; "message not found" on update is reported as
//! `Ok(false)` so the caller can re-send.

pub mod slack;
pub mod telegram;

use std::time::Duration;

use serde::Serialize;

pub use slack::SlackClient;
pub use telegram::TelegramClient;

/// Backoff before the single retry of a transient platform failure.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// End-to-end timeout per platform API call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Which messaging platform a destination belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Telegram,
    Slack,
}

impl DestinationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Slack => "slack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "telegram" | "TG" => Some(Self::Telegram),
            "slack" | "SL" => Some(Self::Slack),
            _ => None,
        }
    }
}

/// Errors from platform API operations.
#[derive(Debug)]
pub enum PlatformError {
    /// No credentials configured for the platform.
    NotConfigured(&'static str),
    /// Credentials present but rejected.
    Auth(String),
    /// Transient failure that persisted through the retry.
    Transient(String),
}

impl std::fmt::Display for PlatformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConfigured(platform) => write!(f, "{platform} bot token not configured"),
            Self::Auth(msg) => write!(f, "authentication failed: {msg}"),
            Self::Transient(msg) => write!(f, "platform request failed: {msg}"),
        }
    }
}

impl std::error::Error for PlatformError {}
