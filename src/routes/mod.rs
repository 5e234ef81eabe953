//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group:
//! - [`attach`] — `POST /attach`, `POST /detach`
//! - [`sessions`] — `GET /sessions`
//! - [`events`] — `GET /sessions/{id}/events` (SSE)
//! - [`health`] — `GET /health`
//! - [`webhooks`] — inbound Slack / Telegram bot callbacks

pub mod attach;
pub mod events;
pub mod health;
pub mod sessions;
pub mod webhooks;
