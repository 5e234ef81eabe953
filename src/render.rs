//! Transcript rendering: a pure fold from the event list to one display
//! string per preset, plus the per-session cache of rendered output.
//!
//! The rendered string is what gets pushed to messaging destinations: the
//! Telegram client sends it as Markdown, the Slack client wraps it in a code
//! block. Display order is stable: USER blocks, assistant turns (ASSISTANT
//! through TOOL_CALL/DURATION until the next USER or ClearAll), SYSTEM lines
//! and compaction notices. THINKING blocks are never rendered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

use crate::events::{BlockContent, Event, QuestionContent, ToolCallContent};

/// Maximum question options shown before the overflow notice.
pub const MAX_QUESTION_OPTIONS: usize = 5;

/// A named rendering mode selecting layout density and truncation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Preset {
    Desktop,
    Mobile,
}

impl Preset {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "desktop" => Some(Self::Desktop),
            "mobile" => Some(Self::Mobile),
            _ => None,
        }
    }

    fn tool_result_limit(self) -> usize {
        match self {
            Self::Desktop => 500,
            Self::Mobile => 120,
        }
    }

    fn text_limit(self) -> usize {
        match self {
            Self::Desktop => 4000,
            Self::Mobile => 1000,
        }
    }
}

/// Escape Telegram-Markdown metacharacters: `_ * ` [`.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Emoji for a tool name.
pub fn tool_icon(tool_name: &str) -> &'static str {
    match tool_name {
        "Read" => "📖",
        "Write" => "📝",
        "Edit" => "✏️",
        "Bash" => "🔧",
        "Glob" | "Grep" => "🔍",
        "Task" => "🤖",
        "WebSearch" | "WebFetch" => "🌐",
        _ => "⚙️",
    }
}

// ─── Fold state ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Turn {
    assistant_text: String,
    tools: Vec<ToolCallContent>,
    duration_ms: Option<u64>,
    open: bool,
}

#[derive(Debug)]
enum Segment {
    User(String),
    Turn(Turn),
    System(String),
    Question(QuestionContent),
    Compaction,
}

#[derive(Debug, Default)]
struct Transcript {
    segments: Vec<Segment>,
}

impl Transcript {
    fn fold(events: &[Event]) -> Self {
        let mut t = Self::default();
        for event in events {
            t.apply(event);
        }
        t
    }

    fn apply(&mut self, event: &Event) {
        match event {
            Event::AddBlock { block } => self.add(&block.content),
            Event::UpdateBlock { content, .. } => self.update(content),
            Event::ClearAll {} => {
                self.segments.clear();
                self.segments.push(Segment::Compaction);
            }
        }
    }

    fn add(&mut self, content: &BlockContent) {
        match content {
            BlockContent::User { text } => {
                self.close_turn();
                self.segments.push(Segment::User(text.clone()));
            }
            BlockContent::Assistant { text } => {
                let turn = self.open_turn();
                if !turn.assistant_text.is_empty() {
                    turn.assistant_text.push_str("\n\n");
                }
                turn.assistant_text.push_str(text);
            }
            BlockContent::ToolCall(tool) => {
                self.open_turn().tools.push(tool.clone());
            }
            BlockContent::Duration { duration_ms } => {
                if let Some(Segment::Turn(turn)) = self.segments.last_mut() {
                    turn.duration_ms = Some(*duration_ms);
                }
            }
            BlockContent::System { text } => {
                self.segments.push(Segment::System(text.clone()));
            }
            BlockContent::Question(question) => {
                self.segments.push(Segment::Question(question.clone()));
            }
            BlockContent::Thinking { .. } => {}
        }
    }

    fn update(&mut self, content: &BlockContent) {
        match content {
            BlockContent::ToolCall(update) => {
                // Results arrive for the most recent matching invocation.
                for segment in self.segments.iter_mut().rev() {
                    if let Segment::Turn(turn) = segment {
                        if let Some(tool) = turn
                            .tools
                            .iter_mut()
                            .rev()
                            .find(|t| t.tool_use_id == update.tool_use_id)
                        {
                            tool.result = update.result.clone();
                            tool.is_error = update.is_error;
                            return;
                        }
                    }
                }
            }
            BlockContent::Question(update) => {
                for segment in self.segments.iter_mut().rev() {
                    if let Segment::Question(q) = segment {
                        if q.tool_use_id == update.tool_use_id {
                            *q = update.clone();
                            return;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn open_turn(&mut self) -> &mut Turn {
        let reuse = matches!(self.segments.last(), Some(Segment::Turn(t)) if t.open);
        if !reuse {
            self.segments.push(Segment::Turn(Turn {
                assistant_text: String::new(),
                tools: Vec::new(),
                duration_ms: None,
                open: true,
            }));
        }
        match self.segments.last_mut() {
            Some(Segment::Turn(turn)) => turn,
            _ => unreachable!("turn segment just pushed"),
        }
    }

    fn close_turn(&mut self) {
        if let Some(Segment::Turn(turn)) = self.segments.last_mut() {
            turn.open = false;
        }
    }

    /// The latest unanswered question, for interactive affordances.
    fn pending_question(&self) -> Option<&QuestionContent> {
        self.segments.iter().rev().find_map(|s| match s {
            Segment::Question(q) if !q.is_answered() => Some(q),
            _ => None,
        })
    }
}

// ─── Rendering ───────────────────────────────────────────────────────────────

/// Fold the session's events into the display string for a preset.
pub fn render(events: &[Event], preset: Preset) -> String {
    let transcript = Transcript::fold(events);
    let mut parts = Vec::with_capacity(transcript.segments.len());
    for segment in &transcript.segments {
        parts.push(render_segment(segment, preset));
    }
    parts.join("\n\n")
}

fn render_segment(segment: &Segment, preset: Preset) -> String {
    match segment {
        Segment::User(text) => format!(
            "👤 *User*\n\n{}",
            escape_markdown(&clip(text, preset.text_limit()))
        ),
        Segment::Turn(turn) => render_turn(turn, preset),
        Segment::System(text) => format!("⚡ *{}*", escape_markdown(text)),
        Segment::Question(question) => render_question(question),
        Segment::Compaction => "⚡ *Context compacted* — previous messages cleared".to_string(),
    }
}

fn render_turn(turn: &Turn, preset: Preset) -> String {
    let mut parts = vec!["🤖 *Assistant*".to_string()];

    if !turn.assistant_text.is_empty() {
        parts.push(format!(
            "\n\n{}",
            escape_markdown(&clip(&turn.assistant_text, preset.text_limit()))
        ));
    }

    for tool in &turn.tools {
        if preset == Preset::Desktop {
            parts.push("\n\n───────────────".to_string());
        }
        parts.push(format!(
            "\n{} *{}* `{}`",
            tool_icon(&tool.tool_name),
            escape_markdown(&tool.tool_name),
            escape_markdown(&tool.label)
        ));
        if let Some(ref result) = tool.result {
            if tool.is_error {
                parts.push("\n✗ Error".to_string());
            } else if !result.is_empty() {
                parts.push(format!(
                    "\n✓ {}",
                    escape_markdown(&clip(result, preset.tool_result_limit()))
                ));
            }
        } else if tool.is_error {
            parts.push("\n✗ Error".to_string());
        }
    }

    if let Some(duration_ms) = turn.duration_ms {
        let seconds = duration_ms as f64 / 1000.0;
        parts.push(format!("\n\n_⏱ {seconds:.1}s_"));
    }

    parts.concat()
}

fn render_question(question: &QuestionContent) -> String {
    let mut lines = Vec::new();
    for q in &question.questions {
        let header = q.header.as_deref().unwrap_or("Question");
        lines.push(format!("❓ *{}*", escape_markdown(header)));
        lines.push(escape_markdown(&q.question));

        if let Some(answer) = question.answers.get(&q.question) {
            lines.push(format!("✅ Selected: _{}_", escape_markdown(answer)));
            continue;
        }

        for option in q.options.iter().take(MAX_QUESTION_OPTIONS) {
            lines.push(format!("• {}", escape_markdown(&option.label)));
        }
        if q.options.len() > MAX_QUESTION_OPTIONS {
            let more = q.options.len() - MAX_QUESTION_OPTIONS;
            let plural = if more > 1 { "s" } else { "" };
            lines.push(format!("_...and {more} more option{plural} in CLI_"));
        }
    }
    if !question.is_answered() {
        lines.push("_(respond in CLI)_".to_string());
    }
    lines.join("\n")
}

fn clip(text: &str, limit: usize) -> String {
    crate::util::truncate_chars(text, limit)
}

// ─── RenderCache ─────────────────────────────────────────────────────────────

struct CacheEntry {
    desktop: String,
    mobile: String,
    pending_question: Option<QuestionContent>,
    touched: Instant,
}

/// Per-session cache of rendered output, rebuilt from scratch on every event
/// batch. Cloneable — clones share the same map.
#[derive(Clone, Default)]
pub struct RenderCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl RenderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute both presets for a session from its full event list.
    pub async fn rebuild(&self, session_id: &str, events: &[Event]) {
        let transcript = Transcript::fold(events);
        let pending_question = transcript.pending_question().cloned();
        let entry = CacheEntry {
            desktop: render(events, Preset::Desktop),
            mobile: render(events, Preset::Mobile),
            pending_question,
            touched: Instant::now(),
        };
        let mut entries = self.entries.write().await;
        entries.insert(session_id.to_string(), entry);
    }

    /// The cached string for a preset, or `None` if not built.
    pub async fn get(&self, session_id: &str, preset: Preset) -> Option<String> {
        let entries = self.entries.read().await;
        entries.get(session_id).map(|e| match preset {
            Preset::Desktop => e.desktop.clone(),
            Preset::Mobile => e.mobile.clone(),
        })
    }

    /// The latest unanswered question of a session, if any.
    pub async fn pending_question(&self, session_id: &str) -> Option<QuestionContent> {
        let entries = self.entries.read().await;
        entries.get(session_id)?.pending_question.clone()
    }

    pub async fn remove(&self, session_id: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(session_id);
    }

    /// Evict entries idle past `threshold`, except the sessions in `keep`
    /// (those with active bindings).
    pub async fn evict_idle(&self, threshold: Duration, keep: &[String]) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|session_id, entry| {
            keep.iter().any(|k| k == session_id) || entry.touched.elapsed() < threshold
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("evicted {evicted} idle render cache entries");
        }
    }
}
