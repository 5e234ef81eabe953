//! Attach / detach endpoints.
//!
//! - `POST /attach` — bind a destination to a session, creating the live
//!   platform message
//! - `POST /detach` — remove a destination binding

use std::path::PathBuf;

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::render::Preset;
use crate::service::{DestinationSpec, ServiceError};
use crate::AppState;

/// Telegram's platform-native "General" topic; never addressable as a
/// thread.
const RESERVED_THREAD_ID: i64 = 1;

/// Destination as submitted in request bodies.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum DestinationBody {
    #[serde(rename = "TG")]
    Telegram {
        chat_id: String,
        #[serde(default)]
        thread_id: Option<i64>,
    },
    #[serde(rename = "SL")]
    Slack { channel: String },
}

impl DestinationBody {
    /// Boundary validation: non-empty identifiers, positive thread ids,
    /// thread 1 reserved.
    fn validate(&self) -> Result<DestinationSpec, String> {
        match self {
            Self::Telegram { chat_id, thread_id } => {
                if chat_id.is_empty() {
                    return Err("chat_id must be non-empty".to_string());
                }
                if let Some(thread_id) = thread_id {
                    if *thread_id == RESERVED_THREAD_ID {
                        return Err(format!(
                            "thread_id {RESERVED_THREAD_ID} is the reserved General topic"
                        ));
                    }
                    if *thread_id <= 0 {
                        return Err("thread_id must be a positive integer".to_string());
                    }
                }
                Ok(DestinationSpec::Telegram {
                    chat_id: chat_id.clone(),
                    thread_id: *thread_id,
                })
            }
            Self::Slack { channel } => {
                if channel.is_empty() {
                    return Err("channel must be non-empty".to_string());
                }
                Ok(DestinationSpec::Slack {
                    channel: channel.clone(),
                })
            }
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Telegram { chat_id, thread_id } => {
                let mut obj = json!({"type": "TG", "chat_id": chat_id});
                if let Some(thread_id) = thread_id {
                    obj["thread_id"] = json!(thread_id);
                }
                obj
            }
            Self::Slack { channel } => json!({"type": "SL", "channel": channel}),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AttachRequest {
    pub session_id: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub destination: DestinationBody,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub replay_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DetachRequest {
    pub session_id: String,
    pub destination: DestinationBody,
}

type ErrorResponse = (StatusCode, Json<Value>);

fn bad_request(message: impl Into<String>) -> ErrorResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.into()})),
    )
}

fn map_service_error(error: &ServiceError) -> ErrorResponse {
    let status = match error {
        ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::CredentialsAbsent(_) => StatusCode::UNAUTHORIZED,
        ServiceError::CredentialsRejected(_) => StatusCode::FORBIDDEN,
        ServiceError::Upstream(_) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({"error": error.to_string()})))
}

/// `POST /attach` — attach a destination and create its live message.
pub async fn attach(
    State(state): State<AppState>,
    Json(request): Json<AttachRequest>,
) -> Result<(StatusCode, Json<Value>), ErrorResponse> {
    if request.session_id.is_empty() {
        return Err(bad_request("session_id must be non-empty"));
    }
    let spec = request.destination.validate().map_err(bad_request)?;

    if let Some(ref path) = request.path {
        if !path.is_absolute() {
            return Err(bad_request(format!(
                "path must be absolute: {}",
                path.display()
            )));
        }
    }

    let preset = match request.preset.as_deref() {
        None => Preset::Desktop,
        Some(raw) => {
            Preset::parse(raw).ok_or_else(|| bad_request(format!("unknown preset: {raw}")))?
        }
    };

    let outcome = state
        .service
        .attach(
            &request.session_id,
            request.path.as_deref(),
            &spec,
            preset,
            request.replay_count,
        )
        .await
        .map_err(|e| map_service_error(&e))?;

    let status = if outcome.attached {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(json!({
            "attached": outcome.attached,
            "session_id": request.session_id,
            "destination": request.destination.to_json(),
            "preset": preset.as_str(),
            "message_id": outcome.message_id,
            "replayed_events": outcome.replayed_events,
        })),
    ))
}

/// `POST /detach` — remove a destination binding.
pub async fn detach(
    State(state): State<AppState>,
    Json(request): Json<DetachRequest>,
) -> Result<StatusCode, ErrorResponse> {
    if request.session_id.is_empty() {
        return Err(bad_request("session_id must be non-empty"));
    }
    let spec = request.destination.validate().map_err(bad_request)?;

    state
        .service
        .detach(&request.session_id, &spec)
        .await
        .map_err(|e| map_service_error(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_body_parses_tagged_forms() {
        let tg: DestinationBody = serde_json::from_value(json!({
            "type": "TG", "chat_id": "-100123", "thread_id": 7
        }))
        .unwrap();
        match tg.validate().unwrap() {
            DestinationSpec::Telegram { chat_id, thread_id } => {
                assert_eq!(chat_id, "-100123");
                assert_eq!(thread_id, Some(7));
            }
            other => panic!("unexpected: {other:?}"),
        }

        let sl: DestinationBody =
            serde_json::from_value(json!({"type": "SL", "channel": "C01"})).unwrap();
        assert!(sl.validate().is_ok());
    }

    #[test]
    fn test_reserved_thread_rejected() {
        let body = DestinationBody::Telegram {
            chat_id: "42".into(),
            thread_id: Some(1),
        };
        let err = body.validate().unwrap_err();
        assert!(err.contains("reserved"));
    }

    #[test]
    fn test_non_positive_thread_rejected() {
        for thread_id in [0, -5] {
            let body = DestinationBody::Telegram {
                chat_id: "42".into(),
                thread_id: Some(thread_id),
            };
            assert!(body.validate().is_err());
        }
    }

    #[test]
    fn test_empty_identifiers_rejected() {
        assert!(DestinationBody::Telegram {
            chat_id: String::new(),
            thread_id: None,
        }
        .validate()
        .is_err());
        assert!(DestinationBody::Slack {
            channel: String::new(),
        }
        .validate()
        .is_err());
    }
}
