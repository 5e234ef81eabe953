//! Telegram Bot API client.
//!
//! Sends and edits the single live session message per chat (or supergroup
//! topic), with Markdown content produced by the renderer. Unanswered
//! questions get an inline keyboard whose callback payloads follow
//! `q:<tool_use_id>:<question>:<option>` within Telegram's 64-byte limit.

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{PlatformError, REQUEST_TIMEOUT, RETRY_BACKOFF};
use crate::events::QuestionContent;

/// Telegram message length cap.
const MAX_MESSAGE_LENGTH: usize = 4096;

/// Telegram callback_data byte limit.
const MAX_CALLBACK_BYTES: usize = 64;

/// Maximum inline keyboard buttons per question.
pub const MAX_QUESTION_BUTTONS: usize = 5;

/// Button label character cap (ellipsised beyond).
const MAX_BUTTON_LABEL: usize = 30;

/// Truncate message text to Telegram's limit, marking the cut.
pub fn truncate_message(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_LENGTH {
        return text.to_string();
    }
    let kept: String = text.chars().take(MAX_MESSAGE_LENGTH - 20).collect();
    format!("{kept}\n\n... [truncated]")
}

/// Build the inline keyboard markup for an unanswered question, or `None`
/// when the question is answered or has no options.
pub fn question_keyboard(content: &QuestionContent) -> Option<Value> {
    if content.is_answered() {
        return None;
    }

    let mut rows: Vec<Value> = Vec::new();
    for (q_idx, question) in content.questions.iter().enumerate() {
        for (opt_idx, option) in question.options.iter().take(MAX_QUESTION_BUTTONS).enumerate() {
            let callback = callback_data(&content.tool_use_id, q_idx, opt_idx);
            let mut label = option.label.clone();
            if label.chars().count() > MAX_BUTTON_LABEL {
                label = label.chars().take(MAX_BUTTON_LABEL - 3).collect::<String>() + "...";
            }
            rows.push(json!([{ "text": label, "callback_data": callback }]));
        }
    }

    if rows.is_empty() {
        return None;
    }
    Some(json!({ "inline_keyboard": rows }))
}

/// `q:<tool_use_id>:<question>:<option>`, shortened at the tool_use_id end
/// to stay within the 64-byte callback limit.
pub fn callback_data(tool_use_id: &str, question_idx: usize, option_idx: usize) -> String {
    let suffix = format!(":{question_idx}:{option_idx}");
    let budget = MAX_CALLBACK_BYTES - 2 - suffix.len();
    let mut id = tool_use_id.to_string();
    while id.len() > budget {
        id.pop();
    }
    format!("q:{id}{suffix}")
}

/// How an edit attempt resolved, derived from the API error description.
#[derive(Debug, PartialEq, Eq)]
enum EditOutcome {
    /// Content unchanged — the platform treats this as success.
    NotModified,
    /// The message is gone; the caller should re-send.
    NotFound,
    /// Anything else, eligible for one retry.
    Transient,
}

fn classify_edit_failure(description: &str) -> EditOutcome {
    let lower = description.to_lowercase();
    if lower.contains("message is not modified") {
        EditOutcome::NotModified
    } else if lower.contains("message to edit not found") {
        EditOutcome::NotFound
    } else {
        EditOutcome::Transient
    }
}

/// Client for the Telegram Bot API.
pub struct TelegramClient {
    http: reqwest::Client,
    token: String,
    validated: Mutex<bool>,
}

impl TelegramClient {
    pub fn new(token: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            token: token.to_string(),
            validated: Mutex::new(false),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.token)
    }

    /// Validate credentials via `getMe`. Success is cached; failures are not.
    pub async fn validate(&self) -> Result<(), PlatformError> {
        let mut validated = self.validated.lock().await;
        if *validated {
            return Ok(());
        }
        let body = self.call_once("getMe", &json!({})).await?;
        let username = body
            .pointer("/result/username")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!("telegram bot validated: @{username}");
        *validated = true;
        Ok(())
    }

    /// Send a new session message. Returns the platform message id.
    pub async fn send_session_message(
        &self,
        chat_id: &str,
        content: &str,
        thread_id: Option<i64>,
        question: Option<&QuestionContent>,
    ) -> Result<i64, PlatformError> {
        self.validate().await?;

        let mut payload = json!({
            "chat_id": chat_id,
            "text": truncate_message(content),
            "parse_mode": "Markdown",
        });
        if let Some(thread_id) = thread_id {
            payload["message_thread_id"] = json!(thread_id);
        }
        if let Some(markup) = question.and_then(question_keyboard) {
            payload["reply_markup"] = markup;
        }

        let body = self.call_with_retry("sendMessage", &payload).await?;
        body.pointer("/result/message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| PlatformError::Transient("sendMessage returned no message_id".into()))
    }

    /// Edit an existing session message.
    ///
    /// Returns `Ok(false)` when the message is gone (caller re-sends) and
    /// `Ok(true)` when edited or reported "not modified".
    pub async fn update_session_message(
        &self,
        chat_id: &str,
        message_id: i64,
        content: &str,
        question: Option<&QuestionContent>,
    ) -> Result<bool, PlatformError> {
        self.validate().await?;

        let mut payload = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": truncate_message(content),
            "parse_mode": "Markdown",
        });
        if let Some(markup) = question.and_then(question_keyboard) {
            payload["reply_markup"] = markup;
        }

        match self.call_once("editMessageText", &payload).await {
            Ok(_) => Ok(true),
            Err(PlatformError::Transient(description)) => {
                match classify_edit_failure(&description) {
                    EditOutcome::NotModified => Ok(true),
                    EditOutcome::NotFound => Ok(false),
                    EditOutcome::Transient => {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        match self.call_once("editMessageText", &payload).await {
                            Ok(_) => Ok(true),
                            Err(e) => {
                                warn!("failed to edit telegram message {message_id}: {e}");
                                Err(e)
                            }
                        }
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Acknowledge an inline-keyboard callback.
    pub async fn answer_callback(&self, callback_query_id: &str, text: &str) {
        let payload = json!({ "callback_query_id": callback_query_id, "text": text });
        if let Err(e) = self.call_once("answerCallbackQuery", &payload).await {
            warn!("answerCallbackQuery failed: {e}");
        }
    }

    async fn call_with_retry(
        &self,
        method: &str,
        payload: &Value,
    ) -> Result<Value, PlatformError> {
        match self.call_once(method, payload).await {
            Ok(body) => Ok(body),
            Err(PlatformError::Transient(first)) => {
                tokio::time::sleep(RETRY_BACKOFF).await;
                self.call_once(method, payload).await.map_err(|e| {
                    warn!("telegram {method} failed after retry: {e} (first: {first})");
                    e
                })
            }
            Err(e) => Err(e),
        }
    }

    /// One API call. `ok: false` with a 401/403 status becomes an auth
    /// error; everything else is transient.
    async fn call_once(&self, method: &str, payload: &Value) -> Result<Value, PlatformError> {
        let response = self
            .http
            .post(self.api_url(method))
            .json(payload)
            .send()
            .await
            .map_err(|e| PlatformError::Transient(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| PlatformError::Transient(e.to_string()))?;

        if body.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(body);
        }

        let description = body
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            Err(PlatformError::Auth(description))
        } else {
            Err(PlatformError::Transient(description))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Question, QuestionOption};
    use std::collections::HashMap;

    fn question(options: usize, answered: bool) -> QuestionContent {
        let mut answers = HashMap::new();
        if answered {
            answers.insert("Pick".to_string(), "A".to_string());
        }
        QuestionContent {
            tool_use_id: "toolu_0123".into(),
            questions: vec![Question {
                header: None,
                question: "Pick".into(),
                options: (0..options)
                    .map(|i| QuestionOption {
                        label: format!("option {i}"),
                    })
                    .collect(),
            }],
            answers,
        }
    }

    #[test]
    fn test_truncate_message_caps_and_marks() {
        let short = truncate_message("hello");
        assert_eq!(short, "hello");

        let long = "x".repeat(5000);
        let out = truncate_message(&long);
        assert!(out.chars().count() <= MAX_MESSAGE_LENGTH);
        assert!(out.ends_with("... [truncated]"));
    }

    #[test]
    fn test_keyboard_caps_buttons() {
        let markup = question_keyboard(&question(8, false)).unwrap();
        let rows = markup["inline_keyboard"].as_array().unwrap();
        assert_eq!(rows.len(), MAX_QUESTION_BUTTONS);
    }

    #[test]
    fn test_keyboard_absent_when_answered() {
        assert!(question_keyboard(&question(3, true)).is_none());
        assert!(question_keyboard(&question(0, false)).is_none());
    }

    #[test]
    fn test_callback_data_shape_and_limit() {
        let data = callback_data("toolu_0123", 0, 2);
        assert_eq!(data, "q:toolu_0123:0:2");

        let long_id = "t".repeat(100);
        let data = callback_data(&long_id, 12, 4);
        assert!(data.len() <= 64);
        assert!(data.starts_with("q:t"));
        assert!(data.ends_with(":12:4"));
    }

    #[test]
    fn test_button_labels_ellipsised() {
        let content = QuestionContent {
            tool_use_id: "t".into(),
            questions: vec![Question {
                header: None,
                question: "q".into(),
                options: vec![QuestionOption {
                    label: "a".repeat(50),
                }],
            }],
            answers: HashMap::new(),
        };
        let markup = question_keyboard(&content).unwrap();
        let label = markup["inline_keyboard"][0][0]["text"].as_str().unwrap();
        assert_eq!(label.chars().count(), 30);
        assert!(label.ends_with("..."));
    }

    #[test]
    fn test_classify_edit_failure() {
        assert_eq!(
            classify_edit_failure("Bad Request: message is not modified"),
            EditOutcome::NotModified
        );
        assert_eq!(
            classify_edit_failure("Bad Request: message to edit not found"),
            EditOutcome::NotFound
        );
        assert_eq!(classify_edit_failure("Too Many Requests"), EditOutcome::Transient);
    }
}
