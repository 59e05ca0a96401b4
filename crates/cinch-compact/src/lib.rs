//! Context budget accounting and transcript compaction for LLM agents.
//!
//! A long-running agent session accumulates tool output and conversation
//! until it no longer fits the model's context window. This crate decides
//! *when* a transcript must shrink and performs the shrinking:
//!
//! - **[`context::budget`]** counts tokens and classifies usage against the
//!   model's window (normal / warning / error / auto-compact due / blocking).
//! - **[`context::eviction`]** (micro-compaction) swaps old, bulky tool
//!   results for references to side files. No LLM call.
//! - **[`context::session_memory`]** rebuilds a compacted transcript from an
//!   incrementally maintained summary plus the verbatim recent tail.
//! - **[`compact`]** orchestrates a full LLM summarization: pre-compact
//!   hooks, the streaming call with retry, file restoration, post-compact
//!   hooks, and assembly of the new transcript.
//!
//! # Quick start
//!
//! ```ignore
//! use cinch_compact::prelude::*;
//!
//! let config = CompactionConfig::from_env();
//! let budget = ContextBudget::new("anthropic/claude-sonnet-4", &config);
//! let transport = Arc::new(OpenRouterTransport::from_env()?);
//! let compactor = Compactor::new(config, budget, transport);
//!
//! let cancel = CancellationToken::new();
//! if let Some(outcome) = compactor
//!     .auto_compact_if_needed(&mut transcript, QuerySource::MainThread, &cancel)
//!     .await?
//! {
//!     println!("{}", outcome.display_text);
//! }
//! ```

pub mod api;
pub mod compact;
pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod lock;
pub mod persist;
pub mod prelude;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use error::CompactError;

// Re-export schemars for downstream crates.
pub use schemars;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. Used for summarizer tool parameters and for
/// validating hook output.
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a transcript entry.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// One content block inside a [`Message`].
///
/// A `ToolUse` and the `ToolResult` carrying the same id together form a
/// tool invocation record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "is_false")]
        is_error: bool,
    },
}

/// What started a compaction.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompactTrigger {
    Manual,
    Auto,
}

impl std::fmt::Display for CompactTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactTrigger::Manual => write!(f, "manual"),
            CompactTrigger::Auto => write!(f, "auto"),
        }
    }
}

/// Marker subtype for synthetic system entries.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageSubtype {
    CompactBoundary,
}

/// Metadata recorded on a compaction boundary marker.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompactMetadata {
    pub trigger: CompactTrigger,
    pub pre_tokens: usize,
}

/// A transcript entry. Never mutated once appended; transformations
/// produce new values.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub uuid: String,
    pub role: MessageRole,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Bookkeeping entry (not part of the conversation proper).
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_meta: bool,
    /// The continuation message written by a compaction.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_compact_summary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<MessageSubtype>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compact_metadata: Option<CompactMetadata>,
    /// Last message before a compaction boundary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_parent_uuid: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Message {
    /// A new message with a fresh v4 uuid and the current timestamp.
    pub fn new(role: MessageRole, content: Vec<ContentBlock>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            role,
            content,
            timestamp: Some(Utc::now()),
            is_meta: false,
            is_compact_summary: false,
            subtype: None,
            compact_metadata: None,
            logical_parent_uuid: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, vec![ContentBlock::Text { text: text.into() }])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![ContentBlock::Text { text: text.into() }])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(
            MessageRole::Assistant,
            vec![ContentBlock::Text { text: text.into() }],
        )
    }

    pub fn assistant_tool_use(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::new(
            MessageRole::Assistant,
            vec![ContentBlock::ToolUse {
                id: id.into(),
                name: name.into(),
                input,
            }],
        )
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            MessageRole::User,
            vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error: false,
            }],
        )
    }

    /// Replace the generated uuid.
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    /// Mark as a bookkeeping entry.
    pub fn meta(mut self) -> Self {
        self.is_meta = true;
        self
    }

    /// Concatenated text of all `Text` blocks.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    pub fn is_compact_boundary(&self) -> bool {
        self.subtype == Some(MessageSubtype::CompactBoundary)
    }

    /// System bookkeeping: meta system entries and old boundary markers.
    pub fn is_system_meta(&self) -> bool {
        self.role == MessageRole::System && (self.is_meta || self.is_compact_boundary())
    }

    /// Tool use ids introduced by this message.
    pub fn tool_use_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
            _ => None,
        })
    }

    /// Tool use ids this message answers.
    pub fn tool_result_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
            _ => None,
        })
    }
}

// ── Transcript ─────────────────────────────────────────────────────

/// The ordered message history of one session.
///
/// The only place a [`CompactionResult`](compact::CompactionResult) is
/// committed. A failed compaction never reaches [`Transcript::commit`], so
/// the history stays exactly as it was.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    session_id: String,
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
        }
    }

    pub fn from_messages(session_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            session_id: session_id.into(),
            messages,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Replace the history with the assembled compaction output.
    pub fn commit(&mut self, result: &compact::CompactionResult) {
        self.messages = result.assemble();
    }

    /// Replace the history with a micro-compacted copy.
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Parse a JSONL transcript (one [`Message`] per line; blank lines ignored).
    pub fn from_jsonl(session_id: impl Into<String>, jsonl: &str) -> Result<Self, CompactError> {
        let mut messages = Vec::new();
        for line in jsonl.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            messages.push(serde_json::from_str(line)?);
        }
        Ok(Self::from_messages(session_id, messages))
    }

    /// Serialize as JSONL.
    pub fn to_jsonl(&self) -> Result<String, CompactError> {
        let mut out = String::new();
        for message in &self.messages {
            out.push_str(&serde_json::to_string(message)?);
            out.push('\n');
        }
        Ok(out)
    }
}

// ── Wire types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the API (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    /// Create a function-calling tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Token usage statistics reported by the provider.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}
