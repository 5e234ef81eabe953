//! Inbound bot webhooks.
//!
//! - `POST /slack/commands` — slash commands (form-encoded)
//! - `POST /slack/interactions` — button clicks (form-encoded `payload`)
//! - `POST /telegram/webhook` — all Telegram updates
//!
//! Slack requests are authenticated by HMAC-SHA256 over
//! `v0:<timestamp>:<raw body>` with the signing secret, compared in constant
//! time; stale timestamps (> 5 min skew) are rejected. Telegram has no
//! signature scheme — the webhook path itself is the secret, as in the Bot
//! API's own deployment model.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::util::unix_now;
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew for Slack request timestamps.
const SLACK_TIMESTAMP_MAX_AGE: i64 = 300;

/// Verify a Slack request signature.
///
/// The signature header carries `v0=<hex hmac>` computed over
/// `v0:<timestamp>:<body>`. Rejects missing headers, stale timestamps and
/// mismatched digests; the digest comparison is constant-time.
pub fn verify_slack_signature(
    body: &[u8],
    timestamp: Option<&str>,
    signature: Option<&str>,
    signing_secret: &str,
) -> bool {
    let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
        return false;
    };

    let Ok(request_time) = timestamp.parse::<i64>() else {
        warn!("invalid slack timestamp: {timestamp}");
        return false;
    };
    let now = unix_now() as i64;
    if (now - request_time).abs() > SLACK_TIMESTAMP_MAX_AGE {
        warn!("slack timestamp too old: {request_time} (now: {now})");
        return false;
    }

    let Some(hex_digest) = signature.strip_prefix("v0=") else {
        return false;
    };
    let Ok(provided) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// Parse an `application/x-www-form-urlencoded` body.
fn parse_form(data: &str) -> HashMap<String, String> {
    data.split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((percent_decode(key), percent_decode(value)))
        })
        .collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|pair| std::str::from_utf8(pair).ok())
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok());
                if let Some(byte) = hex {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn slack_auth(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), (StatusCode, Json<Value>)> {
    let Some(secret) = state.service.slack_signing_secret() else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "slack signing secret not configured"})),
        ));
    };
    let timestamp = headers
        .get("x-slack-request-timestamp")
        .and_then(|v| v.to_str().ok());
    let signature = headers
        .get("x-slack-signature")
        .and_then(|v| v.to_str().ok());
    if !verify_slack_signature(body, timestamp, signature, secret) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid request signature"})),
        ));
    }
    Ok(())
}

/// `POST /slack/commands` — slash command dispatch.
pub async fn slack_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    slack_auth(&state, &headers, &body)?;

    let form = parse_form(&String::from_utf8_lossy(&body));
    let command = form.get("command").map_or("", String::as_str);
    let text = form.get("text").map_or("", String::as_str);
    let user_id = form.get("user_id").map_or("", String::as_str);
    info!("slack command {command} from {user_id}: {text:?}");

    Ok(Json(json!({
        "response_type": "ephemeral",
        "text": format!("Received {command}"),
    })))
}

/// `POST /slack/interactions` — button clicks and menu selections.
pub async fn slack_interaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    slack_auth(&state, &headers, &body)?;

    let form = parse_form(&String::from_utf8_lossy(&body));
    let Some(payload) = form.get("payload") else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing payload"})),
        ));
    };
    let Ok(payload) = serde_json::from_str::<Value>(payload) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "payload is not valid JSON"})),
        ));
    };

    for action in payload
        .get("actions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let action_id = action.get("action_id").and_then(Value::as_str).unwrap_or("");
        let value = action.get("value").and_then(Value::as_str).unwrap_or("");
        if action_id.starts_with("question_opt_") {
            info!("slack question answer selected: {value}");
        } else {
            debug!("unhandled slack interaction: {action_id}");
        }
    }

    Ok(StatusCode::OK)
}

/// `POST /telegram/webhook` — messages and callback queries.
///
/// Question callbacks (`q:<tool_use_id>:<question>:<option>`) are
/// acknowledged so the client stops its spinner; answers flow back through
/// the transcript itself.
pub async fn telegram_webhook(
    State(state): State<AppState>,
    Json(update): Json<Value>,
) -> Json<Value> {
    if let Some(callback) = update.get("callback_query") {
        let data = callback.get("data").and_then(Value::as_str).unwrap_or("");
        let callback_id = callback.get("id").and_then(Value::as_str).unwrap_or("");
        if data.starts_with("q:") {
            info!("telegram question answer selected: {data}");
            if let Some(client) = state.service.telegram_client() {
                client
                    .answer_callback(callback_id, "Selection noted — respond in the CLI")
                    .await;
            }
        } else {
            debug!("unhandled telegram callback: {data}");
        }
    } else if let Some(message) = update.get("message") {
        let text = message.get("text").and_then(Value::as_str).unwrap_or("");
        if text.starts_with('/') {
            info!("telegram command: {text}");
        }
    }

    Json(json!({"ok": true}))
}
