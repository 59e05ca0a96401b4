//! Compaction orchestrator.
//!
//! [`Compactor::compact`] shrinks one session's transcript:
//!
//! 1. Reject empty transcripts and take the session's in-flight lock.
//! 2. Without custom instructions, try the session-memory fast path
//!    ([`crate::context::session_memory`]). Auto-triggered requests pass the
//!    auto-compact threshold as the ceiling; manual requests pass none.
//! 3. Otherwise micro-compact, run PreCompact hooks, and ask the summarizer
//!    ([`executor`]) for a summary, which is validated before use.
//! 4. Re-read recently accessed files concurrently with the agent memory and
//!    todo attachments, then run SessionStart hooks.
//! 5. Assemble boundary marker, summary, kept messages, attachments and
//!    hook entries, and commit them to the [`Transcript`].
//!
//! Nothing is committed until every await point has passed, so a failed or
//! canceled compaction leaves the transcript exactly as it was. A
//! [`progress::ProgressReset`] guard resets progress indicators on every
//! exit path.

pub mod attachments;
pub mod executor;
pub mod progress;
pub mod prompt;

use crate::api::LlmTransport;
use crate::config::CompactionConfig;
use crate::context::budget::{ContextBudget, QuerySource};
use crate::context::eviction::{ToolResultStore, micro_compact};
use crate::context::file_tracker::{MAX_RESTORED_FILE_CHARS, ReadFileState, restore_recent_files};
use crate::context::session_memory::{
    FastPathRequest, SessionMemoryCompactor, SessionMemoryStore, SessionMemoryTemplate,
};
use crate::hooks::{
    HookEvent, HookRunner, NoHooks, merge_instructions, process_pre_compact, session_start_entries,
};
use crate::lock::KeyedLocks;
use crate::persist::sanitize_key;
use crate::{
    CompactError, CompactMetadata, CompactTrigger, Message, MessageRole, MessageSubtype, ToolDef,
    Transcript, UsageInfo,
};
use executor::{SummaryExecutor, build_summary_request, summarizer_tools};
use progress::{CompactEvent, CompactEventHandler, HookPhase, NoopHandler, ProgressReset, StreamMode};
use prompt::{clean_summary, format_summary_for_continuation, validate_summary};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shown with every successful compaction.
pub const TRANSCRIPT_HINT: &str = "(ctrl+o to see full summary)";

// ── Result ─────────────────────────────────────────────────────────

/// Which strategy produced a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionPath {
    /// Rebuilt from the session-memory template; no LLM call.
    SessionMemory,
    /// Summarized by the LLM.
    Summarized,
}

/// Everything a successful compaction produced.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub boundary_marker: Message,
    pub summary_messages: Vec<Message>,
    /// Recent messages preserved verbatim.
    pub messages_to_keep: Vec<Message>,
    pub attachments: Vec<Message>,
    pub hook_results: Vec<Message>,
    pub pre_token_count: usize,
    pub post_token_count: usize,
    /// Provider usage for the summarization call.
    pub usage: Option<UsageInfo>,
    /// PreCompact hook status lines.
    pub user_display_message: Option<String>,
    pub path: CompactionPath,
}

impl CompactionResult {
    /// The new transcript: boundary, summary, kept messages, attachments,
    /// hook entries.
    pub fn assemble(&self) -> Vec<Message> {
        std::iter::once(&self.boundary_marker)
            .chain(&self.summary_messages)
            .chain(&self.messages_to_keep)
            .chain(&self.attachments)
            .chain(&self.hook_results)
            .cloned()
            .collect()
    }
}

/// The system entry marking where a compaction happened.
pub fn compact_boundary(
    trigger: CompactTrigger,
    pre_tokens: usize,
    last_message_uuid: Option<&str>,
) -> Message {
    let mut marker = Message::system("Conversation compacted");
    marker.subtype = Some(MessageSubtype::CompactBoundary);
    marker.compact_metadata = Some(CompactMetadata {
        trigger,
        pre_tokens,
    });
    marker.logical_parent_uuid = last_message_uuid.map(str::to_string);
    marker
}

/// The user-role continuation message that carries the summary.
pub fn summary_message(text: String) -> Message {
    let mut message = Message::new(
        MessageRole::User,
        vec![crate::ContentBlock::Text { text }],
    );
    message.is_compact_summary = true;
    message
}

// ── Requests ───────────────────────────────────────────────────────

/// One compaction request.
#[derive(Debug, Clone)]
pub struct CompactRequest {
    pub trigger: CompactTrigger,
    /// Free-text guidance for the summary. Non-empty instructions skip the
    /// session-memory fast path.
    pub custom_instructions: Option<String>,
    /// Tell the agent to carry on without asking the user.
    pub auto_resume: bool,
}

impl CompactRequest {
    pub fn manual(custom_instructions: Option<String>) -> Self {
        Self {
            trigger: CompactTrigger::Manual,
            custom_instructions,
            auto_resume: false,
        }
    }

    pub fn auto() -> Self {
        Self {
            trigger: CompactTrigger::Auto,
            custom_instructions: None,
            auto_resume: true,
        }
    }

    fn instructions(&self) -> Option<&str> {
        self.custom_instructions
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// A committed compaction and the text to show the user.
#[derive(Debug, Clone)]
pub struct CompactOutcome {
    pub result: CompactionResult,
    pub display_text: String,
}

/// Result plus the summary text that seeds the next template.
struct Compacted {
    result: CompactionResult,
    summary: Option<String>,
}

fn tip_for(request: &CompactRequest, path: CompactionPath) -> Option<&'static str> {
    match (request.trigger, path) {
        (CompactTrigger::Auto, _) => Some(
            "Tip: set CINCH_AUTOCOMPACT_PCT_OVERRIDE to compact earlier, or DISABLE_AUTO_COMPACT=1 to compact only on request",
        ),
        (CompactTrigger::Manual, CompactionPath::SessionMemory) => {
            Some("Tip: pass instructions to compact to re-summarize with a specific focus")
        }
        (CompactTrigger::Manual, CompactionPath::Summarized) if request.instructions().is_none() => {
            Some("Tip: pass instructions to compact to steer what the summary keeps")
        }
        _ => None,
    }
}

/// `Compacted (ctrl+o …)`, then hook status lines, then a tip.
pub fn display_text(result: &CompactionResult, tip: Option<&str>) -> String {
    let mut lines = vec![TRANSCRIPT_HINT.to_string()];
    if let Some(message) = &result.user_display_message {
        lines.push(message.clone());
    }
    if let Some(tip) = tip {
        lines.push(tip.to_string());
    }
    format!("Compacted {}", lines.join("\n"))
}

// ── Compactor ──────────────────────────────────────────────────────

/// Compaction entry point for one model and configuration.
///
/// Put it behind an `Arc` to compact from several tasks. Compactions of
/// the same session never overlap: a second
/// request waits or fails according to
/// [`InFlightPolicy`](crate::config::InFlightPolicy).
pub struct Compactor {
    config: CompactionConfig,
    budget: ContextBudget,
    transport: Arc<dyn LlmTransport>,
    hooks: Arc<dyn HookRunner>,
    events: Arc<dyn CompactEventHandler>,
    sessions: KeyedLocks,
    memory: SessionMemoryStore,
    read_files: Arc<ReadFileState>,
    workdir: PathBuf,
    transcript_dir: Option<PathBuf>,
    external_tools: Vec<ToolDef>,
}

impl Compactor {
    pub fn new(
        config: CompactionConfig,
        budget: ContextBudget,
        transport: Arc<dyn LlmTransport>,
    ) -> Self {
        let memory = SessionMemoryStore::new(&config.data_dir);
        Self {
            config,
            budget,
            transport,
            hooks: Arc::new(NoHooks),
            events: Arc::new(NoopHandler),
            sessions: KeyedLocks::new(),
            memory,
            read_files: Arc::new(ReadFileState::default()),
            workdir: PathBuf::from("."),
            transcript_dir: None,
            external_tools: Vec::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn HookRunner>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn CompactEventHandler>) -> Self {
        self.events = handler;
        self
    }

    /// Share a file tracker with the agent loop that records reads.
    pub fn with_read_file_state(mut self, state: Arc<ReadFileState>) -> Self {
        self.read_files = state;
        self
    }

    /// Base for relative file paths and `memory/MEMORY.md`.
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = dir.into();
        self
    }

    /// Directory holding `<session>.jsonl` transcripts. The summary points
    /// the agent at the full transcript there.
    pub fn with_transcript_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transcript_dir = Some(dir.into());
        self
    }

    /// Caller tools offered to tool-aware summarization.
    pub fn with_external_tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.external_tools = tools;
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn budget(&self) -> &ContextBudget {
        &self.budget
    }

    pub fn read_file_state(&self) -> &Arc<ReadFileState> {
        &self.read_files
    }

    pub fn session_memory(&self) -> &SessionMemoryStore {
        &self.memory
    }

    /// Whether a compaction currently holds `session_id`.
    pub fn is_compacting(&self, session_id: &str) -> bool {
        self.sessions.is_held(session_id)
    }

    fn transcript_path(&self, session_id: &str) -> Option<PathBuf> {
        self.transcript_dir
            .as_deref()
            .map(|dir| transcript_file(dir, session_id))
    }

    /// Compact after a turn if the transcript crossed the auto-compact
    /// threshold. `Ok(None)` when no compaction was due.
    pub async fn auto_compact_if_needed(
        &self,
        transcript: &mut Transcript,
        source: QuerySource,
        cancel: &CancellationToken,
    ) -> Result<Option<CompactOutcome>, CompactError> {
        if !self.config.compact_enabled
            || !self.budget.should_auto_compact(transcript.messages(), source)
        {
            return Ok(None);
        }
        info!(
            "Auto-compact due: {}",
            self.budget.status(transcript.messages()).to_log_string()
        );
        self.compact(transcript, CompactRequest::auto(), cancel)
            .await
            .map(Some)
    }

    /// Run one compaction and commit it to `transcript`.
    pub async fn compact(
        &self,
        transcript: &mut Transcript,
        request: CompactRequest,
        cancel: &CancellationToken,
    ) -> Result<CompactOutcome, CompactError> {
        if !self.config.compact_enabled {
            return Err(CompactError::Disabled);
        }
        if transcript.is_empty() {
            return Err(CompactError::EmptyTranscript);
        }

        let session_id = transcript.session_id().to_string();
        let _guard = self
            .sessions
            .acquire_with(&session_id, self.config.in_flight, cancel)
            .await?;
        let _reset = ProgressReset::new(self.events.clone());

        let compacted = match self.run(transcript, &request, cancel).await {
            Ok(compacted) => compacted,
            Err(e) => return Err(self.handle_error(e, cancel)),
        };

        transcript.commit(&compacted.result);
        info!(
            "Compacted session {session_id} via {:?}: {} -> {} tokens",
            compacted.result.path, compacted.result.pre_token_count, compacted.result.post_token_count
        );
        self.advance_template(&session_id, &compacted, cancel).await;

        let tip = tip_for(&request, compacted.result.path);
        let display_text = display_text(&compacted.result, tip);
        Ok(CompactOutcome {
            result: compacted.result,
            display_text,
        })
    }

    /// Single error path: cancellation wins over whatever failed.
    fn handle_error(&self, error: CompactError, cancel: &CancellationToken) -> CompactError {
        if cancel.is_cancelled() || error.is_canceled() {
            info!("Compaction canceled");
            return CompactError::Canceled;
        }
        warn!("Compaction failed: {error}");
        error
    }

    async fn run(
        &self,
        transcript: &Transcript,
        request: &CompactRequest,
        cancel: &CancellationToken,
    ) -> Result<Compacted, CompactError> {
        let pre_tokens = self.budget.count_tokens(transcript.messages());
        self.events.on_event(&CompactEvent::Started {
            trigger: request.trigger,
            pre_tokens,
        });

        if request.instructions().is_none() {
            let ceiling = match request.trigger {
                CompactTrigger::Auto => Some(self.budget.auto_compact_threshold()),
                CompactTrigger::Manual => None,
            };
            let transcript_path = self.transcript_path(transcript.session_id());
            let fast_path = SessionMemoryCompactor {
                enabled: self.config.session_memory,
                store: &self.memory,
                budget: &self.budget,
                hooks: self.hooks.as_ref(),
                hook_timeout: self.config.hook_timeout,
                transcript_path: transcript_path.as_deref(),
            };
            let fast = FastPathRequest {
                trigger: request.trigger,
                ceiling,
                auto_resume: request.auto_resume,
            };
            if let Ok(result) = fast_path.reconstruct(transcript, fast, cancel).await {
                self.read_files.snapshot_and_clear();
                return Ok(Compacted {
                    result,
                    summary: None,
                });
            }
            if cancel.is_cancelled() {
                return Err(CompactError::Canceled);
            }
        }

        self.summarize(transcript, request, cancel).await
    }

    /// The LLM path.
    async fn summarize(
        &self,
        transcript: &Transcript,
        request: &CompactRequest,
        cancel: &CancellationToken,
    ) -> Result<Compacted, CompactError> {
        let session_id = transcript.session_id();
        let store = ToolResultStore::new(&self.config.data_dir, session_id);
        let micro = micro_compact(
            transcript.messages(),
            None,
            &self.budget,
            &self.config.micro_compact,
            &store,
        )
        .await?;
        if !micro.is_noop() {
            debug!(
                "Micro-compacted {} tool result(s) before summarizing",
                micro.evicted.len()
            );
        }
        let messages = micro.messages;
        let pre_token_count = self.budget.count_tokens(&messages);

        // PreCompact hooks
        self.events
            .on_event(&CompactEvent::HooksStarted(HookPhase::PreCompact));
        let outcomes = self
            .hooks
            .run(
                &HookEvent::PreCompact {
                    trigger: request.trigger,
                    custom_instructions: request.instructions().map(str::to_string),
                },
                self.config.hook_timeout,
                cancel,
            )
            .await;
        check_cancel(cancel)?;
        let pre_compact = process_pre_compact(&outcomes);
        let instructions = merge_instructions(
            request.instructions(),
            pre_compact.new_custom_instructions.as_deref(),
        );

        // Summary
        self.events
            .on_event(&CompactEvent::StreamMode(StreamMode::Requesting));
        self.events.on_event(&CompactEvent::ResponseLength(0));
        let tools = summarizer_tools(
            self.config.tool_aware_summary,
            self.budget.limits().supports_tools,
            &self.external_tools,
        );
        let summary_request =
            build_summary_request(self.budget.model(), &messages, instructions.as_deref(), tools);
        let executor = SummaryExecutor {
            transport: self.transport.as_ref(),
            retry: &self.config.retry,
            cache_sharing: self.config.cache_sharing,
            events: self.events.as_ref(),
        };
        let response = executor.execute(&summary_request, cancel).await?;
        let summary = validate_summary(&response.text)?;

        // Attachments
        let snapshot = self.read_files.snapshot_and_clear();
        let (restored, memory, todos) = tokio::join!(
            restore_recent_files(
                &snapshot,
                &self.workdir,
                self.config.max_restored_files,
                MAX_RESTORED_FILE_CHARS,
                cancel,
            ),
            attachments::agent_memory(&self.workdir, cancel),
            attachments::todo_context(&self.config.data_dir, session_id, cancel),
        );
        check_cancel(cancel)?;
        let mut attached = restored;
        attached.extend(memory);
        attached.extend(todos);

        // SessionStart hooks
        self.events
            .on_event(&CompactEvent::HooksStarted(HookPhase::SessionStart));
        let outcomes = self
            .hooks
            .run(
                &HookEvent::SessionStart {
                    model: self.budget.model().to_string(),
                },
                self.config.hook_timeout,
                cancel,
            )
            .await;
        check_cancel(cancel)?;

        let transcript_path = self.transcript_path(session_id);
        let continuation = format_summary_for_continuation(
            summary,
            request.auto_resume,
            transcript_path.as_deref(),
            false,
        );
        let mut result = CompactionResult {
            boundary_marker: compact_boundary(
                request.trigger,
                pre_token_count,
                messages.last().map(|m| m.uuid.as_str()),
            ),
            summary_messages: vec![summary_message(continuation)],
            messages_to_keep: Vec::new(),
            attachments: attached,
            hook_results: session_start_entries(&outcomes),
            pre_token_count,
            post_token_count: 0,
            usage: response.usage.clone(),
            user_display_message: pre_compact.user_display_message,
            path: CompactionPath::Summarized,
        };
        result.post_token_count = self.budget.count_tokens(&result.assemble());

        Ok(Compacted {
            result,
            summary: Some(clean_summary(summary)),
        })
    }

    /// Point the template at the new summary message so the next fast path
    /// keeps everything after it. A fresh LLM summary replaces the content.
    async fn advance_template(
        &self,
        session_id: &str,
        compacted: &Compacted,
        cancel: &CancellationToken,
    ) {
        if !self.config.session_memory {
            return;
        }
        let Some(anchor) = compacted.result.summary_messages.last() else {
            return;
        };
        let update = match &compacted.summary {
            Some(content) => {
                let template = SessionMemoryTemplate::new(
                    session_id,
                    content.clone(),
                    Some(anchor.uuid.clone()),
                );
                self.memory.save(template, cancel).await
            }
            None => {
                self.memory
                    .record_progress(session_id, &anchor.uuid, cancel)
                    .await
            }
        };
        if let Err(e) = update {
            warn!("Failed to update session memory for {session_id}: {e}");
        }
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), CompactError> {
    if cancel.is_cancelled() {
        Err(CompactError::Canceled)
    } else {
        Ok(())
    }
}

/// Transcript file for `session_id` under `dir`.
pub fn transcript_file(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{}.jsonl", sanitize_key(session_id)))
}
