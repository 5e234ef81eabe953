//! Semantic event model for session transcripts.
//!
//! The tailer produces raw JSONL records; [`crate::transform`] turns them into
//! the events defined here. Events are what the rest of the service consumes:
//! the buffer stores them, the SSE hub broadcasts them, and the renderer folds
//! them into presentation strings.

use serde::{Deserialize, Serialize};

/// A semantic change to the displayed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A new block appeared at the end of the transcript.
    AddBlock { block: Block },
    /// An existing block's content changed (e.g. a tool call got its result).
    UpdateBlock {
        block_id: String,
        content: BlockContent,
    },
    /// The upstream session compacted its context; all prior blocks are
    /// superseded.
    ClearAll {},
}

impl Event {
    /// Variant tag used as the SSE `event:` field.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::AddBlock { .. } => "add_block",
            Self::UpdateBlock { .. } => "update_block",
            Self::ClearAll {} => "clear_all",
        }
    }
}

/// One display block within a session transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Stable identifier, unique within a session (assigned by the transformer).
    pub id: String,
    #[serde(flatten)]
    pub content: BlockContent,
}

/// Typed content per block kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockContent {
    User { text: String },
    Assistant { text: String },
    /// Internal reasoning; never rendered.
    Thinking { text: String },
    ToolCall(ToolCallContent),
    /// Wall-clock duration of a completed turn.
    Duration { duration_ms: u64 },
    System { text: String },
    Question(QuestionContent),
}

impl BlockContent {
    pub fn kind(&self) -> BlockKind {
        match self {
            Self::User { .. } => BlockKind::User,
            Self::Assistant { .. } => BlockKind::Assistant,
            Self::Thinking { .. } => BlockKind::Thinking,
            Self::ToolCall(_) => BlockKind::ToolCall,
            Self::Duration { .. } => BlockKind::Duration,
            Self::System { .. } => BlockKind::System,
            Self::Question(_) => BlockKind::Question,
        }
    }
}

/// Block kind discriminant, handy for counting and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    User,
    Assistant,
    Thinking,
    ToolCall,
    Duration,
    System,
    Question,
}

/// A tool invocation with its (eventual) result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallContent {
    pub tool_use_id: String,
    pub tool_name: String,
    /// Abbreviated input for display, e.g. a basename or truncated command.
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

/// A question posed to the user, with selectable options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionContent {
    pub tool_use_id: String,
    pub questions: Vec<Question>,
    /// question text → chosen option label, filled in once answered.
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub answers: std::collections::HashMap<String, String>,
}

impl QuestionContent {
    pub fn is_answered(&self) -> bool {
        !self.answers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    pub question: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
}
