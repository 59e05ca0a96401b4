//! Convenience re-exports for common `cinch-compact` types.
//!
//! ```ignore
//! use cinch_compact::prelude::*;
//! ```
//!
//! Covers wiring a [`Compactor`] into an agent loop: configuration, the
//! budget, the transport and hook seams, and progress handlers. Eviction
//! internals, SSE decoding, and the session-memory store are left out;
//! import those from their modules when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    CompactError, CompactTrigger, ContentBlock, Message, MessageRole, ToolDef, Transcript,
    UsageInfo, json_schema_for,
};

// ── Configuration ───────────────────────────────────────────────────
pub use crate::config::{CompactSettings, CompactionConfig, InFlightPolicy, Toggle};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{
    BudgetLevel, ContextBudget, ContextSources, ContextUsage, QuerySource, ReadFileState,
    TokenBudgetStatus, Tokenizer,
};

// ── Compaction ──────────────────────────────────────────────────────
pub use crate::compact::progress::{
    CompactEvent, CompactEventHandler, FnEventHandler, LoggingHandler, NoopHandler,
};
pub use crate::compact::{
    CompactOutcome, CompactRequest, CompactionPath, CompactionResult, Compactor,
};

// ── Transport and hooks ─────────────────────────────────────────────
pub use crate::api::{LlmTransport, OpenRouterTransport, RetryConfig};
pub use crate::hooks::{ExternalHookRunner, HookEvent, HookOutcome, HookRunner, NoHooks};

pub use std::sync::Arc;
pub use tokio_util::sync::CancellationToken;
