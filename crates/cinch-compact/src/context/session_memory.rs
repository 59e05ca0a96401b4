//! Session-memory compaction: rebuild without an LLM call.
//!
//! A session-memory template is an incrementally maintained summary of the
//! conversation up to some message (the *last absorbed* id). When one exists,
//! a compaction can skip summarization entirely: the new transcript is the
//! template plus the verbatim messages after the last absorbed id.
//!
//! The fast path is strictly best-effort. Every way it can fail produces an
//! [`Unavailable`] reason and the caller falls back to full summarization;
//! nothing here ever surfaces as a [`CompactError`] to the user.
//!
//! Templates live under `<data_dir>/session-memory/<session>.json` and are
//! written with atomic replace-on-write. Writers hold the session's key in a
//! [`KeyedLocks`] registry for the whole read-modify-write cycle.

use super::budget::ContextBudget;
use crate::compact::prompt::format_summary_for_continuation;
use crate::compact::{CompactionPath, CompactionResult, compact_boundary, summary_message};
use crate::hooks::{HookEvent, HookRunner, session_start_entries};
use crate::lock::KeyedLocks;
use crate::persist::{sanitize_key, write_atomic};
use crate::{CompactError, CompactTrigger, Message, Transcript};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ── Template and store ─────────────────────────────────────────────

/// The persisted incremental summary for one session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionMemoryTemplate {
    pub session_id: String,
    pub content: String,
    /// Uuid of the last message the content covers. `None` for a session
    /// resumed without tracking.
    #[serde(default)]
    pub last_summarized_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionMemoryTemplate {
    pub fn new(
        session_id: impl Into<String>,
        content: impl Into<String>,
        last_summarized_id: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            content: content.into(),
            last_summarized_id,
            updated_at: Utc::now(),
        }
    }

    /// Whitespace-only content carries nothing worth keeping.
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// File-backed template store.
#[derive(Debug, Clone)]
pub struct SessionMemoryStore {
    dir: PathBuf,
    locks: KeyedLocks,
}

impl SessionMemoryStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("session-memory"),
            locks: KeyedLocks::new(),
        }
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(session_id)))
    }

    /// Read the committed template. Lock-free: files are only ever replaced
    /// whole, so a reader sees either the old or the new version.
    pub async fn load(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionMemoryTemplate>, CompactError> {
        let path = self.path_for(session_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write under the session's key. Returning `None` from `f`
    /// deletes the template.
    pub async fn update<F>(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<Option<SessionMemoryTemplate>, CompactError>
    where
        F: FnOnce(Option<SessionMemoryTemplate>) -> Option<SessionMemoryTemplate>,
    {
        let _guard = self.locks.acquire(session_id, cancel).await?;
        let current = self.load(session_id).await?;
        let next = f(current);
        let path = self.path_for(session_id);
        match &next {
            Some(template) => {
                let bytes = serde_json::to_vec_pretty(template)?;
                write_atomic(&path, &bytes).await?;
            }
            None => match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(next)
    }

    pub async fn save(
        &self,
        template: SessionMemoryTemplate,
        cancel: &CancellationToken,
    ) -> Result<(), CompactError> {
        let session_id = template.session_id.clone();
        self.update(&session_id, cancel, |_| Some(template)).await?;
        Ok(())
    }

    pub async fn invalidate(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), CompactError> {
        self.update(session_id, cancel, |_| None).await?;
        Ok(())
    }

    /// Move the last-absorbed id forward without touching the content.
    pub async fn record_progress(
        &self,
        session_id: &str,
        last_summarized_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), CompactError> {
        self.update(session_id, cancel, |current| {
            current.map(|mut t| {
                t.last_summarized_id = Some(last_summarized_id.to_string());
                t.updated_at = Utc::now();
                t
            })
        })
        .await?;
        Ok(())
    }
}

// ── Fast path ──────────────────────────────────────────────────────

/// Why the fast path declined. Never shown to the user.
#[derive(Debug, Error, PartialEq)]
pub enum Unavailable {
    #[error("session memory is disabled")]
    Disabled,
    #[error("no session-memory template")]
    NoTemplate,
    #[error("session-memory template is empty")]
    EmptyTemplate,
    #[error("last summarized message is not in the transcript")]
    SplitPointMissing,
    #[error("reconstructed transcript ({post_tokens} tokens) meets the ceiling ({ceiling})")]
    CeilingExceeded { post_tokens: usize, ceiling: usize },
    #[error("reconstruction failed: {0}")]
    Failed(String),
}

/// Request parameters for one fast-path attempt.
#[derive(Debug, Clone, Copy)]
pub struct FastPathRequest {
    pub trigger: CompactTrigger,
    /// Reject the result if it would still be at least this large.
    pub ceiling: Option<usize>,
    pub auto_resume: bool,
}

/// Everything the fast path needs besides the transcript.
pub struct SessionMemoryCompactor<'a> {
    pub enabled: bool,
    pub store: &'a SessionMemoryStore,
    pub budget: &'a ContextBudget,
    pub hooks: &'a dyn HookRunner,
    pub hook_timeout: Duration,
    pub transcript_path: Option<&'a Path>,
}

impl SessionMemoryCompactor<'_> {
    /// Try to rebuild `transcript` from its template. The split point is
    /// re-validated against the live messages on every call.
    pub async fn reconstruct(
        &self,
        transcript: &Transcript,
        request: FastPathRequest,
        cancel: &CancellationToken,
    ) -> Result<CompactionResult, Unavailable> {
        let result = self.try_reconstruct(transcript, request, cancel).await;
        match &result {
            Ok(r) => info!(
                "session-memory compaction: {} -> {} tokens, {} recent message(s) kept",
                r.pre_token_count,
                r.post_token_count,
                r.messages_to_keep.len()
            ),
            Err(reason @ Unavailable::Failed(_)) => warn!("session-memory compaction unavailable: {reason}"),
            Err(reason) => debug!("session-memory compaction unavailable: {reason}"),
        }
        result
    }

    async fn try_reconstruct(
        &self,
        transcript: &Transcript,
        request: FastPathRequest,
        cancel: &CancellationToken,
    ) -> Result<CompactionResult, Unavailable> {
        if !self.enabled {
            return Err(Unavailable::Disabled);
        }
        let session_id = transcript.session_id();
        let template = self
            .store
            .load(session_id)
            .await
            .map_err(|e| Unavailable::Failed(e.to_string()))?
            .ok_or(Unavailable::NoTemplate)?;
        if template.is_empty() {
            return Err(Unavailable::EmptyTemplate);
        }

        let messages = transcript.messages();
        let split = match &template.last_summarized_id {
            Some(id) => match messages.iter().position(|m| &m.uuid == id) {
                Some(idx) => idx + 1,
                None => {
                    warn!("Last summarized message {id} missing from transcript; invalidating session memory");
                    if let Err(e) = self.store.invalidate(session_id, cancel).await {
                        warn!("Failed to invalidate session memory: {e}");
                    }
                    return Err(Unavailable::SplitPointMissing);
                }
            },
            None => 0,
        };

        let start = adjust_for_tool_pairs(messages, split);
        let tail: Vec<Message> = messages
            .get(start..)
            .unwrap_or_default()
            .iter()
            .filter(|m| !is_bookkeeping(m))
            .cloned()
            .collect();

        let outcomes = self
            .hooks
            .run(
                &HookEvent::SessionStart {
                    model: self.budget.model().to_string(),
                },
                self.hook_timeout,
                cancel,
            )
            .await;
        if cancel.is_cancelled() {
            return Err(Unavailable::Failed("canceled".into()));
        }

        let pre_token_count = self.budget.count_tokens(messages);
        let summary = summary_message(format_summary_for_continuation(
            &template.content,
            request.auto_resume,
            self.transcript_path,
            !tail.is_empty(),
        ));
        let mut result = CompactionResult {
            boundary_marker: compact_boundary(
                request.trigger,
                pre_token_count,
                messages.last().map(|m| m.uuid.as_str()),
            ),
            summary_messages: vec![summary],
            messages_to_keep: tail,
            attachments: Vec::new(),
            hook_results: session_start_entries(&outcomes),
            pre_token_count,
            post_token_count: 0,
            usage: None,
            user_display_message: None,
            path: CompactionPath::SessionMemory,
        };

        let post_tokens = self.budget.count_tokens(&result.assemble());
        if let Some(ceiling) = request.ceiling
            && post_tokens >= ceiling
        {
            return Err(Unavailable::CeilingExceeded {
                post_tokens,
                ceiling,
            });
        }
        result.post_token_count = post_tokens;
        Ok(result)
    }
}

/// Entries that never belong in a rebuilt tail.
fn is_bookkeeping(message: &Message) -> bool {
    message.is_system_meta() || message.is_meta || message.is_compact_summary
}

/// Move `start` backward until every tool result in `messages[start..]` has
/// its tool use in the same range.
pub fn adjust_for_tool_pairs(messages: &[Message], start: usize) -> usize {
    let mut start = start.min(messages.len());
    loop {
        let tail = messages.get(start..).unwrap_or_default();
        let introduced: HashSet<&str> = tail.iter().flat_map(|m| m.tool_use_ids()).collect();
        let orphaned: HashSet<&str> = tail
            .iter()
            .flat_map(|m| m.tool_result_ids())
            .filter(|id| !introduced.contains(id))
            .collect();
        if orphaned.is_empty() {
            return start;
        }
        let Some(owner) = messages
            .get(..start)
            .unwrap_or_default()
            .iter()
            .rposition(|m| m.tool_use_ids().any(|id| orphaned.contains(id)))
        else {
            return start;
        };
        start = owner;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompactionConfig;
    use crate::hooks::NoHooks;
    use crate::{CompactTrigger, MessageRole};
    use serde_json::json;

    fn numbered(n: usize) -> Vec<Message> {
        (1..=n)
            .map(|i| {
                let msg = if i % 2 == 1 {
                    Message::user(format!("question {i}"))
                } else {
                    Message::assistant_text(format!("answer {i}"))
                };
                msg.with_uuid(format!("m{i}"))
            })
            .collect()
    }

    fn budget() -> ContextBudget {
        ContextBudget::new("test-model", &CompactionConfig::default())
            .with_tokenizer(|t: &str| t.len())
    }

    fn request(ceiling: Option<usize>) -> FastPathRequest {
        FastPathRequest {
            trigger: CompactTrigger::Manual,
            ceiling,
            auto_resume: false,
        }
    }

    #[tokio::test]
    async fn store_update_and_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionMemoryStore::new(dir.path());
        let cancel = CancellationToken::new();

        assert_eq!(store.load("s1").await.unwrap(), None);
        store
            .save(SessionMemoryTemplate::new("s1", "notes", None), &cancel)
            .await
            .unwrap();
        store.record_progress("s1", "m7", &cancel).await.unwrap();
        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.content, "notes");
        assert_eq!(loaded.last_summarized_id.as_deref(), Some("m7"));

        store.invalidate("s1", &cancel).await.unwrap();
        assert_eq!(store.load("s1").await.unwrap(), None);
        // Invalidating twice is fine.
        store.invalidate("s1", &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn record_progress_without_template_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionMemoryStore::new(dir.path());
        store
            .record_progress("s1", "m1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!store.path_for("s1").exists());
    }

    #[tokio::test]
    async fn rebuilds_from_template_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionMemoryStore::new(dir.path());
        let cancel = CancellationToken::new();
        store
            .save(
                SessionMemoryTemplate::new("s1", "# Notes\nworking on parser", Some("m40".into())),
                &cancel,
            )
            .await
            .unwrap();

        let transcript = Transcript::from_messages("s1", numbered(50));
        let budget = budget();
        let fast = SessionMemoryCompactor {
            enabled: true,
            store: &store,
            budget: &budget,
            hooks: &NoHooks,
            hook_timeout: Duration::from_secs(1),
            transcript_path: None,
        };
        let result = fast.reconstruct(&transcript, request(None), &cancel).await.unwrap();

        let kept: Vec<&str> = result.messages_to_keep.iter().map(|m| m.uuid.as_str()).collect();
        let expected: Vec<String> = (41..=50).map(|i| format!("m{i}")).collect();
        assert_eq!(kept, expected.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(result.path, CompactionPath::SessionMemory);
        assert_eq!(result.post_token_count, budget.count_tokens(&result.assemble()));
        assert!(result.summary_messages[0].text().contains("working on parser"));
        assert_eq!(
            result.boundary_marker.logical_parent_uuid.as_deref(),
            Some("m50")
        );
    }

    #[tokio::test]
    async fn missing_split_point_invalidates_template() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionMemoryStore::new(dir.path());
        let cancel = CancellationToken::new();
        store
            .save(SessionMemoryTemplate::new("s1", "notes", Some("gone".into())), &cancel)
            .await
            .unwrap();

        let transcript = Transcript::from_messages("s1", numbered(5));
        let budget = budget();
        let fast = SessionMemoryCompactor {
            enabled: true,
            store: &store,
            budget: &budget,
            hooks: &NoHooks,
            hook_timeout: Duration::from_secs(1),
            transcript_path: None,
        };
        let err = fast.reconstruct(&transcript, request(None), &cancel).await.unwrap_err();
        assert_eq!(err, Unavailable::SplitPointMissing);
        assert_eq!(store.load("s1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn without_id_everything_is_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionMemoryStore::new(dir.path());
        let cancel = CancellationToken::new();
        store
            .save(SessionMemoryTemplate::new("s1", "notes", None), &cancel)
            .await
            .unwrap();

        let mut messages = numbered(4);
        messages.insert(0, Message::system("old boundary").meta());
        let transcript = Transcript::from_messages("s1", messages);
        let budget = budget();
        let fast = SessionMemoryCompactor {
            enabled: true,
            store: &store,
            budget: &budget,
            hooks: &NoHooks,
            hook_timeout: Duration::from_secs(1),
            transcript_path: None,
        };
        let result = fast.reconstruct(&transcript, request(None), &cancel).await.unwrap();
        assert_eq!(result.messages_to_keep.len(), 4);
        assert!(result.messages_to_keep.iter().all(|m| m.role != MessageRole::System));
    }

    #[tokio::test]
    async fn ceiling_rejects_large_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionMemoryStore::new(dir.path());
        let cancel = CancellationToken::new();
        store
            .save(SessionMemoryTemplate::new("s1", "x".repeat(500), Some("m1".into())), &cancel)
            .await
            .unwrap();

        let transcript = Transcript::from_messages("s1", numbered(3));
        let budget = budget();
        let fast = SessionMemoryCompactor {
            enabled: true,
            store: &store,
            budget: &budget,
            hooks: &NoHooks,
            hook_timeout: Duration::from_secs(1),
            transcript_path: None,
        };
        let err = fast.reconstruct(&transcript, request(Some(100)), &cancel).await.unwrap_err();
        assert!(matches!(err, Unavailable::CeilingExceeded { ceiling: 100, .. }));
    }

    #[tokio::test]
    async fn disabled_and_empty_templates_decline() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionMemoryStore::new(dir.path());
        let cancel = CancellationToken::new();
        let transcript = Transcript::from_messages("s1", numbered(3));
        let budget = budget();
        let mut fast = SessionMemoryCompactor {
            enabled: true,
            store: &store,
            budget: &budget,
            hooks: &NoHooks,
            hook_timeout: Duration::from_secs(1),
            transcript_path: None,
        };
        assert_eq!(
            fast.reconstruct(&transcript, request(None), &cancel).await.unwrap_err(),
            Unavailable::NoTemplate
        );

        store
            .save(SessionMemoryTemplate::new("s1", "  \n ", None), &cancel)
            .await
            .unwrap();
        assert_eq!(
            fast.reconstruct(&transcript, request(None), &cancel).await.unwrap_err(),
            Unavailable::EmptyTemplate
        );

        fast.enabled = false;
        assert_eq!(
            fast.reconstruct(&transcript, request(None), &cancel).await.unwrap_err(),
            Unavailable::Disabled
        );
    }

    #[tokio::test]
    async fn corrupt_template_is_a_soft_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionMemoryStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("session-memory")).unwrap();
        std::fs::write(store.path_for("s1"), "{truncated").unwrap();

        let transcript = Transcript::from_messages("s1", numbered(3));
        let budget = budget();
        let fast = SessionMemoryCompactor {
            enabled: true,
            store: &store,
            budget: &budget,
            hooks: &NoHooks,
            hook_timeout: Duration::from_secs(1),
            transcript_path: None,
        };
        let err = fast
            .reconstruct(&transcript, request(None), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Unavailable::Failed(_)));
    }

    #[test]
    fn tail_never_splits_a_tool_pair() {
        let messages = vec![
            Message::user("go").with_uuid("u1"),
            Message::assistant_tool_use("t1", "bash", json!({"command": "ls"})).with_uuid("a1"),
            Message::tool_result("t1", "src").with_uuid("r1"),
            Message::assistant_text("done").with_uuid("a2"),
        ];
        // Split right after the tool use: the result would be orphaned.
        assert_eq!(adjust_for_tool_pairs(&messages, 2), 1);
        assert_eq!(adjust_for_tool_pairs(&messages, 3), 3);
        assert_eq!(adjust_for_tool_pairs(&messages, 10), 4);
    }
}
