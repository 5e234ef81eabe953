//! Raw JSONL records → semantic events.
//!
//! [`transform`] is a pure function: it consumes a batch of parsed transcript
//! records together with a [`TransformContext`] and yields the derived events
//! plus the updated context. The context is serialised into the session
//! checkpoint so processing resumes exactly where it left off after a restart.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{
    Block, BlockContent, Event, Question, QuestionContent, QuestionOption, ToolCallContent,
};

/// Tool name of the interactive question tool.
const QUESTION_TOOL: &str = "AskUserQuestion";

/// Persisted transformer state.
///
/// Tracks block-id allocation and the mapping from in-flight `tool_use_id`s to
/// the block they created, so a later `tool_result` record can be turned into
/// an [`Event::UpdateBlock`] for the right block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformContext {
    #[serde(default)]
    pub block_counter: u64,
    /// tool_use_id → block id of the ToolCall / Question block it opened.
    #[serde(default)]
    pub pending_tools: HashMap<String, String>,
    /// tool_use_id → question content, kept so an answer record can re-emit
    /// the question with `answers` filled in.
    #[serde(default)]
    pub pending_questions: HashMap<String, QuestionContent>,
}

impl TransformContext {
    fn next_block_id(&mut self) -> String {
        self.block_counter += 1;
        format!("blk_{:06}", self.block_counter)
    }
}

/// Derive events from a batch of records.
///
/// Unknown record shapes are ignored; the transformer never fails. Returns the
/// events in transcript order and the context to persist.
pub fn transform(records: &[Value], ctx: &TransformContext) -> (Vec<Event>, TransformContext) {
    let mut ctx = ctx.clone();
    let mut events = Vec::new();

    for record in records {
        match record.get("type").and_then(Value::as_str) {
            Some("user") => handle_user(record, &mut ctx, &mut events),
            Some("assistant") => handle_assistant(record, &mut ctx, &mut events),
            Some("system") => handle_system(record, &mut ctx, &mut events),
            Some("result") => handle_result(record, &mut ctx, &mut events),
            _ => {}
        }
    }

    (events, ctx)
}

fn handle_user(record: &Value, ctx: &mut TransformContext, events: &mut Vec<Event>) {
    let Some(content) = record.pointer("/message/content") else {
        return;
    };

    match content {
        Value::String(text) => {
            if !text.is_empty() {
                push_block(ctx, events, BlockContent::User { text: text.clone() });
            }
        }
        Value::Array(items) => {
            for item in items {
                match item.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            if !text.is_empty() {
                                push_block(ctx, events, BlockContent::User { text: text.into() });
                            }
                        }
                    }
                    Some("tool_result") => handle_tool_result(item, ctx, events),
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

fn handle_assistant(record: &Value, ctx: &mut TransformContext, events: &mut Vec<Event>) {
    let Some(items) = record.pointer("/message/content").and_then(Value::as_array) else {
        return;
    };

    for item in items {
        match item.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        push_block(ctx, events, BlockContent::Assistant { text: text.into() });
                    }
                }
            }
            Some("thinking") => {
                if let Some(text) = item.get("thinking").and_then(Value::as_str) {
                    push_block(ctx, events, BlockContent::Thinking { text: text.into() });
                }
            }
            Some("tool_use") => handle_tool_use(item, ctx, events),
            _ => {}
        }
    }
}

fn handle_tool_use(item: &Value, ctx: &mut TransformContext, events: &mut Vec<Event>) {
    let tool_use_id = item
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_name = item
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let input = item.get("input").cloned().unwrap_or(Value::Null);

    if tool_name == QUESTION_TOOL {
        let question = parse_question(&tool_use_id, &input);
        let block_id = ctx.next_block_id();
        ctx.pending_tools
            .insert(tool_use_id.clone(), block_id.clone());
        ctx.pending_questions.insert(tool_use_id, question.clone());
        events.push(Event::AddBlock {
            block: Block {
                id: block_id,
                content: BlockContent::Question(question),
            },
        });
        return;
    }

    let label = abbreviate_tool_input(&tool_name, &input);
    let block_id = ctx.next_block_id();
    ctx.pending_tools
        .insert(tool_use_id.clone(), block_id.clone());
    events.push(Event::AddBlock {
        block: Block {
            id: block_id,
            content: BlockContent::ToolCall(ToolCallContent {
                tool_use_id,
                tool_name,
                label,
                result: None,
                is_error: false,
            }),
        },
    });
}

fn handle_tool_result(item: &Value, ctx: &mut TransformContext, events: &mut Vec<Event>) {
    let Some(tool_use_id) = item.get("tool_use_id").and_then(Value::as_str) else {
        return;
    };
    let Some(block_id) = ctx.pending_tools.remove(tool_use_id) else {
        return;
    };

    let is_error = item
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let result_text = tool_result_text(item.get("content"));

    // A result for a pending question carries the chosen answers.
    if let Some(mut question) = ctx.pending_questions.remove(tool_use_id) {
        question.answers = parse_question_answers(&result_text, &question);
        events.push(Event::UpdateBlock {
            block_id,
            content: BlockContent::Question(question),
        });
        return;
    }

    events.push(Event::UpdateBlock {
        block_id,
        content: BlockContent::ToolCall(ToolCallContent {
            tool_use_id: tool_use_id.to_string(),
            tool_name: String::new(),
            label: String::new(),
            result: Some(result_text),
            is_error,
        }),
    });
}

fn handle_system(record: &Value, ctx: &mut TransformContext, events: &mut Vec<Event>) {
    // Context compaction supersedes everything rendered so far.
    if record.get("subtype").and_then(Value::as_str) == Some("compact_boundary") {
        ctx.pending_tools.clear();
        ctx.pending_questions.clear();
        events.push(Event::ClearAll {});
        return;
    }

    let text = record
        .get("content")
        .and_then(Value::as_str)
        .or_else(|| record.get("message").and_then(Value::as_str))
        .unwrap_or_default();
    if !text.is_empty() {
        push_block(ctx, events, BlockContent::System { text: text.into() });
    }
}

fn handle_result(record: &Value, ctx: &mut TransformContext, events: &mut Vec<Event>) {
    if let Some(duration_ms) = record
        .get("duration_ms")
        .or_else(|| record.get("durationMs"))
        .and_then(Value::as_u64)
    {
        push_block(ctx, events, BlockContent::Duration { duration_ms });
    }
}

fn push_block(ctx: &mut TransformContext, events: &mut Vec<Event>, content: BlockContent) {
    let id = ctx.next_block_id();
    events.push(Event::AddBlock {
        block: Block { id, content },
    });
}

/// Extract displayable text from a `tool_result` content field, which may be
/// a plain string or a list of `{type: "text"}` items.
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| {
                (i.get("type").and_then(Value::as_str) == Some("text"))
                    .then(|| i.get("text").and_then(Value::as_str))
                    .flatten()
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn parse_question(tool_use_id: &str, input: &Value) -> QuestionContent {
    let questions = input
        .get("questions")
        .and_then(Value::as_array)
        .map(|qs| {
            qs.iter()
                .filter_map(|q| {
                    let question = q.get("question").and_then(Value::as_str)?.to_string();
                    let header = q
                        .get("header")
                        .and_then(Value::as_str)
                        .map(ToString::to_string);
                    let options = q
                        .get("options")
                        .and_then(Value::as_array)
                        .map(|opts| {
                            opts.iter()
                                .filter_map(|o| {
                                    let label = match o {
                                        Value::String(s) => s.clone(),
                                        other => {
                                            other.get("label").and_then(Value::as_str)?.to_string()
                                        }
                                    };
                                    Some(QuestionOption { label })
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    Some(Question {
                        header,
                        question,
                        options,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    QuestionContent {
        tool_use_id: tool_use_id.to_string(),
        questions,
        answers: HashMap::new(),
    }
}

/// Map an answer result back onto the question set. The result text is either
/// a JSON object `{question: answer}` or a bare answer applied to the single
/// question.
fn parse_question_answers(result: &str, question: &QuestionContent) -> HashMap<String, String> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(result) {
        return map
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
            .collect();
    }
    let mut answers = HashMap::new();
    if let (Some(q), false) = (question.questions.first(), result.is_empty()) {
        answers.insert(q.question.clone(), result.to_string());
    }
    answers
}

// ─── Tool-input abbreviation ─────────────────────────────────────────────────

/// Create a short display label for a tool invocation (max 60 chars).
pub fn abbreviate_tool_input(tool_name: &str, input: &Value) -> String {
    fn field<'a>(input: &'a Value, name: &str) -> Option<&'a str> {
        input.get(name).and_then(Value::as_str).filter(|s| !s.is_empty())
    }
    fn basename(path: &str) -> String {
        path.rsplit('/').next().unwrap_or(path).to_string()
    }
    fn shorten(text: &str) -> String {
        crate::util::truncate_chars(text, 60)
    }

    match tool_name {
        "Bash" => field(input, "description")
            .or_else(|| field(input, "command"))
            .map_or_else(|| "…".to_string(), shorten),
        "Read" | "Write" | "Edit" => {
            field(input, "file_path").map_or_else(|| "…".to_string(), basename)
        }
        "NotebookEdit" => field(input, "notebook_path").map_or_else(|| "…".to_string(), basename),
        "Glob" | "Grep" => field(input, "pattern").map_or_else(|| "…".to_string(), shorten),
        "Task" => field(input, "description").map_or_else(|| "…".to_string(), shorten),
        "WebSearch" => field(input, "query").map_or_else(|| "…".to_string(), shorten),
        "WebFetch" => field(input, "url").map_or_else(|| "…".to_string(), shorten),
        "TodoWrite" => "todos".to_string(),
        _ => "…".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_string_content() {
        let records = vec![json!({"type": "user", "message": {"content": "hello"}})];
        let (events, ctx) = transform(&records, &TransformContext::default());
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::AddBlock { block } => {
                assert_eq!(block.content, BlockContent::User { text: "hello".into() });
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(ctx.block_counter, 1);
    }

    #[test]
    fn test_assistant_text_and_thinking() {
        let records = vec![json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "answer"},
            ]}
        })];
        let (events, _) = transform(&records, &TransformContext::default());
        assert_eq!(events.len(), 2);
        let kinds: Vec<_> = events
            .iter()
            .map(|e| match e {
                Event::AddBlock { block } => block.content.kind(),
                _ => panic!("expected AddBlock"),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![crate::events::BlockKind::Thinking, crate::events::BlockKind::Assistant]
        );
    }

    #[test]
    fn test_tool_use_then_result_updates_same_block() {
        let records = vec![
            json!({
                "type": "assistant",
                "message": {"content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "Bash",
                     "input": {"command": "ls"}},
                ]}
            }),
            json!({
                "type": "user",
                "message": {"content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "file.txt"},
                ]}
            }),
        ];
        let (events, ctx) = transform(&records, &TransformContext::default());
        assert_eq!(events.len(), 2);
        let add_id = match &events[0] {
            Event::AddBlock { block } => block.id.clone(),
            other => panic!("unexpected: {other:?}"),
        };
        match &events[1] {
            Event::UpdateBlock { block_id, content } => {
                assert_eq!(*block_id, add_id);
                match content {
                    BlockContent::ToolCall(tc) => {
                        assert_eq!(tc.result.as_deref(), Some("file.txt"));
                        assert!(!tc.is_error);
                    }
                    other => panic!("unexpected content: {other:?}"),
                }
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(ctx.pending_tools.is_empty());
    }

    #[test]
    fn test_context_survives_split_batches() {
        let first = vec![json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "tool_use", "id": "toolu_9", "name": "Read",
                 "input": {"file_path": "/tmp/a.rs"}},
            ]}
        })];
        let (events1, ctx1) = transform(&first, &TransformContext::default());
        assert_eq!(events1.len(), 1);
        assert!(ctx1.pending_tools.contains_key("toolu_9"));

        let second = vec![json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "toolu_9", "content": "fn main() {}"},
            ]}
        })];
        let (events2, ctx2) = transform(&second, &ctx1);
        assert_eq!(events2.len(), 1);
        assert!(matches!(events2[0], Event::UpdateBlock { .. }));
        assert!(ctx2.pending_tools.is_empty());
    }

    #[test]
    fn test_compact_boundary_clears() {
        let records = vec![json!({"type": "system", "subtype": "compact_boundary"})];
        let (events, _) = transform(&records, &TransformContext::default());
        assert_eq!(events, vec![Event::ClearAll {}]);
    }

    #[test]
    fn test_question_tool_produces_question_block() {
        let records = vec![json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "tool_use", "id": "toolu_q", "name": "AskUserQuestion",
                 "input": {"questions": [
                     {"header": "Choice", "question": "Pick one",
                      "options": [{"label": "A"}, {"label": "B"}]},
                 ]}},
            ]}
        })];
        let (events, ctx) = transform(&records, &TransformContext::default());
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::AddBlock { block } => match &block.content {
                BlockContent::Question(q) => {
                    assert_eq!(q.questions.len(), 1);
                    assert_eq!(q.questions[0].options.len(), 2);
                    assert!(!q.is_answered());
                }
                other => panic!("unexpected content: {other:?}"),
            },
            other => panic!("unexpected: {other:?}"),
        }
        assert!(ctx.pending_questions.contains_key("toolu_q"));
    }

    #[test]
    fn test_malformed_records_are_ignored() {
        let records = vec![json!({"unexpected": true}), json!(42)];
        let (events, ctx) = transform(&records, &TransformContext::default());
        assert!(events.is_empty());
        assert_eq!(ctx.block_counter, 0);
    }

    #[test]
    fn test_abbreviate_rules() {
        assert_eq!(
            abbreviate_tool_input("Read", &json!({"file_path": "/a/b/c.rs"})),
            "c.rs"
        );
        assert_eq!(
            abbreviate_tool_input("Bash", &json!({"command": "ls -la"})),
            "ls -la"
        );
        assert_eq!(abbreviate_tool_input("TodoWrite", &json!({})), "todos");
        assert_eq!(abbreviate_tool_input("Unknown", &json!({})), "…");
        let long = "x".repeat(100);
        let label = abbreviate_tool_input("Grep", &json!({ "pattern": long }));
        assert_eq!(label.chars().count(), 60);
        assert!(label.ends_with('…'));
    }

    #[test]
    fn test_context_round_trips_through_json() {
        let records = vec![json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "tool_use", "id": "toolu_z", "name": "Glob", "input": {"pattern": "*.rs"}},
            ]}
        })];
        let (_, ctx) = transform(&records, &TransformContext::default());
        let blob = serde_json::to_value(&ctx).unwrap();
        let back: TransformContext = serde_json::from_value(blob).unwrap();
        assert_eq!(back, ctx);
    }
}
