//! Error taxonomy for compaction requests.
//!
//! Every fatal outcome of a compaction maps to one [`CompactError`] variant.
//! Soft failures of the session-memory fast path never show up here; they
//! surface as [`Unavailable`](crate::context::session_memory::Unavailable)
//! and trigger the LLM path instead.

use thiserror::Error;

/// Errors returned by the compaction pipeline.
#[derive(Debug, Error)]
pub enum CompactError {
    /// Nothing to compact. Fatal to the request, not to the session.
    #[error("No messages to compact")]
    EmptyTranscript,

    /// The caller's cancellation token fired at an await point.
    #[error("Compaction canceled.")]
    Canceled,

    /// The summarizer answered without any text.
    #[error("Failed to generate conversation summary - response did not contain valid text content")]
    SummaryMissing,

    /// The summarization request itself exceeded the model's window.
    #[error("Conversation too long. Trim the transcript or compact with a smaller model input and try again.")]
    PromptTooLong,

    /// An upstream error returned in place of a summary, surfaced verbatim.
    #[error("{0}")]
    Upstream(String),

    /// Every streaming attempt ended without an assistant message.
    #[error("Compaction interrupted: stream ended without a summary after {attempts} attempt(s)")]
    StreamingFailed { attempts: u32 },

    /// Another compaction holds the session lock and the policy is `Reject`.
    #[error("a compaction is already in flight for session {session_id}")]
    CompactionInFlight { session_id: String },

    /// `DISABLE_COMPACT` is set.
    #[error("compaction is disabled (DISABLE_COMPACT)")]
    Disabled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CompactError {
    /// Caller-initiated abort, as opposed to a failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, CompactError::Canceled)
    }
}
