//! LLM transport layer: the summarization request, streaming, and retry.
//!
//! - [`LlmTransport`] is the seam between the compaction pipeline and any
//!   chat-completions provider. It opens a streamed call and, optionally,
//!   serves a single-turn forked request that reuses the caller's prompt
//!   cache.
//! - [`streaming`]: SSE decoding into typed [`StreamEvent`]s.
//! - [`retry`]: backoff schedule, cancellable sleeps, and transient vs.
//!   permanent error classification.
//! - [`openrouter`]: the reference [`LlmTransport`] over the OpenRouter API.

pub mod openrouter;
pub mod retry;
pub mod streaming;

use crate::context::QuerySource;
use crate::{Message, ToolDef};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

// Re-export commonly used items at the module level.
pub use openrouter::OpenRouterTransport;
pub use retry::RetryConfig;
pub use streaming::{AssistantResponse, BlockKind, EventStream, StreamEvent};

/// One summarization call.
#[derive(Debug, Clone)]
pub struct SummaryRequest {
    pub model: String,
    pub system_prompt: String,
    /// The conversation followed by the summarization instruction.
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDef>,
    pub max_output_tokens: u32,
    pub query_source: QuerySource,
}

/// A chat-completions provider.
///
/// Errors are plain strings at this edge. The executor retries the ones
/// [`retry::is_transient_error`] recognizes and surfaces the rest.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    /// Open a streamed call. The returned stream should stop promptly once
    /// `cancel` fires.
    async fn stream(
        &self,
        request: &SummaryRequest,
        cancel: &CancellationToken,
    ) -> Result<EventStream, String>;

    /// Single turn reusing the caller's prompt cache. The executor passes a
    /// request with no tools. `Ok(None)` means the transport has no such
    /// path.
    async fn fork_single_turn(
        &self,
        _request: &SummaryRequest,
        _cancel: &CancellationToken,
    ) -> Result<Option<AssistantResponse>, String> {
        Ok(None)
    }
}
