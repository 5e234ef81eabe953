//! Slack Web API client.
//!
//! Session content is published as Block Kit documents: the rendered
//! transcript wrapped in a code-block section, plus interactive blocks for
//! an unanswered question. Documents are capped at 50 block elements with a
//! truncation block replacing the tail.

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{PlatformError, REQUEST_TIMEOUT, RETRY_BACKOFF};
use crate::events::QuestionContent;

/// Slack block-count cap per message.
const MAX_BLOCKS: usize = 50;

/// Maximum buttons in a question actions block.
pub const MAX_QUESTION_BUTTONS: usize = 5;

/// Button label character cap (ellipsised beyond).
const MAX_BUTTON_LABEL: usize = 30;

/// Escape Slack mrkdwn special characters: `& < >`.
pub fn escape_mrkdwn(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Cap a block list at [`MAX_BLOCKS`], replacing the tail with a truncation
/// block.
pub fn truncate_blocks(mut blocks: Vec<Value>) -> Vec<Value> {
    if blocks.len() <= MAX_BLOCKS {
        return blocks;
    }
    blocks.truncate(MAX_BLOCKS - 1);
    blocks.push(json!({
        "type": "section",
        "text": {"type": "mrkdwn", "text": "... [truncated]"},
    }));
    blocks
}

/// Build the Block Kit document for a session message: the rendered content
/// in a code block, then question blocks when one is pending.
pub fn session_blocks(content: &str, question: Option<&QuestionContent>) -> Vec<Value> {
    let mut blocks = vec![json!({
        "type": "section",
        "text": {"type": "mrkdwn", "text": format!("```{content}```")},
    })];
    if let Some(question) = question {
        blocks.extend(question_blocks(question));
    }
    truncate_blocks(blocks)
}

/// Interactive blocks for a question.
///
/// Unanswered: one actions block with up to 5 buttons per question, plus a
/// context block stating the overflow count. Answered: sections showing the
/// selection, no actions.
pub fn question_blocks(content: &QuestionContent) -> Vec<Value> {
    let mut blocks = Vec::new();

    for (q_idx, question) in content.questions.iter().enumerate() {
        let header = question.header.as_deref().unwrap_or("Question");
        blocks.push(json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!(
                    ":question: *{}*\n{}",
                    escape_mrkdwn(header),
                    escape_mrkdwn(&question.question)
                ),
            },
        }));

        if let Some(answer) = content.answers.get(&question.question) {
            blocks.push(json!({
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": format!(":white_check_mark: Selected: _{}_", escape_mrkdwn(answer)),
                },
            }));
            continue;
        }

        let buttons: Vec<Value> = question
            .options
            .iter()
            .take(MAX_QUESTION_BUTTONS)
            .enumerate()
            .map(|(opt_idx, option)| {
                let mut label = option.label.clone();
                if label.chars().count() > MAX_BUTTON_LABEL {
                    label = label.chars().take(MAX_BUTTON_LABEL - 3).collect::<String>() + "...";
                }
                json!({
                    "type": "button",
                    "text": {"type": "plain_text", "text": label, "emoji": true},
                    "action_id": format!("question_opt_{q_idx}_{opt_idx}"),
                    "value": format!("{}:{q_idx}:{opt_idx}", content.tool_use_id),
                })
            })
            .collect();

        if !buttons.is_empty() {
            blocks.push(json!({
                "type": "actions",
                "block_id": format!("q_{}_{q_idx}", content.tool_use_id),
                "elements": buttons,
            }));
        }

        if question.options.len() > MAX_QUESTION_BUTTONS {
            let more = question.options.len() - MAX_QUESTION_BUTTONS;
            let plural = if more > 1 { "s" } else { "" };
            blocks.push(json!({
                "type": "context",
                "elements": [{
                    "type": "mrkdwn",
                    "text": format!("_and {more} more option{plural} in CLI_"),
                }],
            }));
        }
    }

    blocks
}

/// Client for the Slack Web API.
pub struct SlackClient {
    http: reqwest::Client,
    token: String,
    validated: Mutex<bool>,
}

impl SlackClient {
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

    /// Validate credentials via `auth.test`. Success is cached; failures are
    /// not.
    pub async fn validate(&self) -> Result<(), PlatformError> {
        let mut validated = self.validated.lock().await;
        if *validated {
            return Ok(());
        }
        let body = self.call_once("auth.test", &json!({})).await?;
        info!(
            "slack bot validated: {} in {}",
            body.get("user").and_then(|v| v.as_str()).unwrap_or("unknown"),
            body.get("team").and_then(|v| v.as_str()).unwrap_or("unknown"),
        );
        *validated = true;
        Ok(())
    }

    /// Post a new session message. Returns the message timestamp (`ts`).
    pub async fn send_session_message(
        &self,
        channel: &str,
        content: &str,
        question: Option<&QuestionContent>,
    ) -> Result<String, PlatformError> {
        self.validate().await?;

        let payload = json!({
            "channel": channel,
            "text": content,
            "blocks": session_blocks(content, question),
        });

        let body = self.call_with_retry("chat.postMessage", &payload).await?;
        body.get("ts")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| PlatformError::Transient("chat.postMessage returned no ts".into()))
    }

    /// Update an existing session message.
    ///
    /// Returns `Ok(false)` when the message is gone (caller re-sends).
    pub async fn update_session_message(
        &self,
        channel: &str,
        ts: &str,
        content: &str,
        question: Option<&QuestionContent>,
    ) -> Result<bool, PlatformError> {
        self.validate().await?;

        let payload = json!({
            "channel": channel,
            "ts": ts,
            "text": content,
            "blocks": session_blocks(content, question),
        });

        match self.call_once("chat.update", &payload).await {
            Ok(_) => Ok(true),
            Err(PlatformError::Transient(error)) if error.contains("message_not_found") => {
                Ok(false)
            }
            Err(PlatformError::Transient(_)) => {
                tokio::time::sleep(RETRY_BACKOFF).await;
                match self.call_once("chat.update", &payload).await {
                    Ok(_) => Ok(true),
                    Err(PlatformError::Transient(error)) if error.contains("message_not_found") => {
                        Ok(false)
                    }
                    Err(e) => {
                        warn!("failed to update slack message {ts}: {e}");
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
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
                    warn!("slack {method} failed after retry: {e} (first: {first})");
                    e
                })
            }
            Err(e) => Err(e),
        }
    }

    /// One API call. Slack reports failures as `ok: false` with an `error`
    /// code; auth-shaped codes become auth errors.
    async fn call_once(&self, method: &str, payload: &Value) -> Result<Value, PlatformError> {
        let response = self
            .http
            .post(format!("https://slack.com/api/{method}"))
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await
            .map_err(|e| PlatformError::Transient(e.to_string()))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| PlatformError::Transient(e.to_string()))?;

        if body.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(body);
        }

        let error = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_string();
        match error.as_str() {
            "invalid_auth" | "account_inactive" | "token_revoked" | "not_authed" => {
                Err(PlatformError::Auth(error))
            }
            _ => Err(PlatformError::Transient(error)),
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
            tool_use_id: "toolu_9".into(),
            questions: vec![Question {
                header: Some("Choice".into()),
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
    fn test_escape_mrkdwn() {
        assert_eq!(escape_mrkdwn("a & b < c > d"), "a &amp; b &lt; c &gt; d");
    }

    #[test]
    fn test_session_blocks_wrap_content_in_code() {
        let blocks = session_blocks("rendered text", None);
        assert_eq!(blocks.len(), 1);
        let text = blocks[0]["text"]["text"].as_str().unwrap();
        assert_eq!(text, "```rendered text```");
    }

    #[test]
    fn test_truncate_blocks_caps_with_marker() {
        let blocks: Vec<Value> = (0..80)
            .map(|i| json!({"type": "section", "text": {"type": "mrkdwn", "text": i.to_string()}}))
            .collect();
        let out = truncate_blocks(blocks);
        assert_eq!(out.len(), MAX_BLOCKS);
        let last = out.last().unwrap()["text"]["text"].as_str().unwrap();
        assert_eq!(last, "... [truncated]");
    }

    #[test]
    fn test_unanswered_question_has_single_actions_block() {
        let blocks = question_blocks(&question(8, false));
        let actions: Vec<&Value> = blocks.iter().filter(|b| b["type"] == "actions").collect();
        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions[0]["elements"].as_array().unwrap().len(),
            MAX_QUESTION_BUTTONS
        );
        // Overflow context block present for the remaining 3 options.
        let context = blocks
            .iter()
            .find(|b| b["type"] == "context")
            .expect("overflow context block");
        let text = context["elements"][0]["text"].as_str().unwrap();
        assert!(text.contains("3 more options"));
    }

    #[test]
    fn test_answered_question_has_no_actions() {
        let blocks = question_blocks(&question(3, true));
        assert!(blocks.iter().all(|b| b["type"] != "actions"));
        let joined = blocks
            .iter()
            .filter_map(|b| b["text"]["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(joined.contains("Selected: _A_"));
    }

    #[test]
    fn test_button_values_carry_routing_payload() {
        let blocks = question_blocks(&question(2, false));
        let actions = blocks.iter().find(|b| b["type"] == "actions").unwrap();
        let value = actions["elements"][1]["value"].as_str().unwrap();
        assert_eq!(value, "toolu_9:0:1");
    }
}
