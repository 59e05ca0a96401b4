//! Micro-compaction: evict old tool results to side files.
//!
//! Tool results are the single largest context consumer in any agent loop.
//! A `read_file` can inject 30KB; a `grep` can return hundreds of lines.
//! Most of it is irrelevant once the model has processed it. This module
//! replaces old results with a one-line reference to a persisted copy,
//! freeing context without any LLM call. The content stays recoverable.
//!
//! Only results of allow-listed tools are eligible, the most recent few are
//! always kept, and results are marked oldest first until the remaining
//! tool output fits the target. Without an explicit target the pass only
//! commits if the transcript is already above the warning level and the
//! savings clear a minimum; otherwise the transcript is returned untouched.

use super::budget::ContextBudget;
use crate::config::Toggle;
use crate::persist::{sanitize_key, write_atomic};
use crate::{CompactError, ContentBlock, Message};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Prefix of every eviction reference.
///
/// Both the reference writer and the "already evicted?" check use this
/// constant so they can't drift out of sync.
pub const EVICTED_PREFIX: &str = "[Evicted tool output:";

/// Target for retained tool-output tokens when the caller gives none.
pub const DEFAULT_MICRO_TOKEN_BUDGET: usize = 40_000;
/// Minimum savings for a threshold-driven pass to be worth committing.
pub const MIN_FREED_TOKENS: usize = 20_000;
/// Most recent compactible results that are never evicted.
pub const RECENT_TOOL_USE_KEEP_COUNT: usize = 3;

/// Tools whose results are bulky and reproducible.
pub const DEFAULT_COMPACTIBLE_TOOLS: &[&str] = &[
    "read_file",
    "bash",
    "grep",
    "glob",
    "find_files",
    "list_files",
    "web_fetch",
    "web_search",
    "edit_file",
    "write_file",
];

/// Configuration for tool result eviction.
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Tool names whose results may be evicted.
    pub compactible_tools: HashSet<String>,
    /// Number of most recent compactible results to keep verbatim.
    pub keep_recent: usize,
    /// Target used when the caller supplies none.
    pub default_target_tokens: usize,
    /// Floor on savings for target-less passes.
    pub min_freed_tokens: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            compactible_tools: DEFAULT_COMPACTIBLE_TOOLS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            keep_recent: RECENT_TOOL_USE_KEEP_COUNT,
            default_target_tokens: DEFAULT_MICRO_TOKEN_BUDGET,
            min_freed_tokens: MIN_FREED_TOKENS,
        }
    }
}

impl EvictionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow results of another tool to be evicted.
    pub fn compactible_tool(mut self, name: impl Into<String>) -> Self {
        self.compactible_tools.insert(name.into());
        self
    }

    pub fn with_keep_recent(mut self, keep: usize) -> Self {
        self.keep_recent = keep;
        self
    }

    pub fn with_min_freed(mut self, tokens: usize) -> Self {
        self.min_freed_tokens = tokens;
        self
    }
}

// ── Side-file store ────────────────────────────────────────────────

/// Where evicted tool output is persisted:
/// `<data_dir>/tool-results/<session>/<tool_use_id>.txt`.
#[derive(Debug, Clone)]
pub struct ToolResultStore {
    dir: PathBuf,
}

impl ToolResultStore {
    pub fn new(data_dir: &Path, session_id: &str) -> Self {
        Self {
            dir: data_dir.join("tool-results").join(sanitize_key(session_id)),
        }
    }

    pub fn path_for(&self, tool_use_id: &str) -> PathBuf {
        self.dir.join(format!("{}.txt", sanitize_key(tool_use_id)))
    }

    /// Persist one result and return its path.
    pub async fn persist(&self, tool_use_id: &str, content: &str) -> std::io::Result<PathBuf> {
        let path = self.path_for(tool_use_id);
        write_atomic(&path, content.as_bytes()).await?;
        Ok(path)
    }
}

// ── Planning ───────────────────────────────────────────────────────

/// One result chosen for eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub tool_use_id: String,
    pub tool_name: String,
    pub tokens: usize,
}

/// Marks computed from a point-in-time view of the transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    /// Oldest first.
    pub marked: Vec<EvictionCandidate>,
    pub tokens_freed: usize,
    /// Tokens across all eligible results before eviction.
    pub total_tool_tokens: usize,
}

impl EvictionPlan {
    pub fn is_empty(&self) -> bool {
        self.marked.is_empty()
    }
}

/// Decide which tool results to evict. Pure; touches nothing on disk.
pub fn plan_eviction(
    messages: &[Message],
    target: Option<usize>,
    budget: &ContextBudget,
    config: &EvictionConfig,
) -> EvictionPlan {
    let already_evicted: HashSet<&str> = messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|b| match b {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } if content.starts_with(EVICTED_PREFIX) => Some(tool_use_id.as_str()),
            _ => None,
        })
        .collect();

    // Eligible tool uses in transcript order, with their result sizes.
    let mut order: Vec<(&str, &str)> = Vec::new();
    let mut eligible: HashSet<&str> = HashSet::new();
    let mut tokens: HashMap<&str, usize> = HashMap::new();
    for block in messages.iter().flat_map(|m| m.content.iter()) {
        match block {
            ContentBlock::ToolUse { id, name, .. }
                if config.compactible_tools.contains(name)
                    && !already_evicted.contains(id.as_str()) =>
            {
                order.push((id.as_str(), name.as_str()));
                eligible.insert(id.as_str());
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } if eligible.contains(tool_use_id.as_str()) => {
                tokens.insert(tool_use_id.as_str(), budget.count_text(content));
            }
            _ => {}
        }
    }

    let total_tool_tokens: usize = tokens.values().sum();
    let keep_from = order.len().saturating_sub(config.keep_recent);
    let limit = target.unwrap_or(config.default_target_tokens);

    let mut plan = EvictionPlan {
        total_tool_tokens,
        ..Default::default()
    };
    for (id, name) in order.iter().take(keep_from) {
        if total_tool_tokens.saturating_sub(plan.tokens_freed) <= limit {
            break;
        }
        // A tool use whose result is missing has nothing to evict.
        let Some(&size) = tokens.get(id) else {
            continue;
        };
        plan.tokens_freed += size;
        plan.marked.push(EvictionCandidate {
            tool_use_id: id.to_string(),
            tool_name: name.to_string(),
            tokens: size,
        });
    }

    if target.is_none() {
        let status = budget.status(messages);
        if !status.above_warning || plan.tokens_freed < config.min_freed_tokens {
            debug!(
                "micro-compact skipped: above_warning={}, freed={} (min {})",
                status.above_warning, plan.tokens_freed, config.min_freed_tokens
            );
            plan.marked.clear();
            plan.tokens_freed = 0;
        }
    }
    plan
}

// ── Applying ───────────────────────────────────────────────────────

/// An evicted result and where its content went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedResult {
    pub tool_use_id: String,
    pub tool_name: String,
    pub tokens: usize,
    pub path: PathBuf,
}

/// Output of a micro-compaction pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MicroCompaction {
    pub messages: Vec<Message>,
    pub evicted: Vec<EvictedResult>,
    pub tokens_freed: usize,
}

impl MicroCompaction {
    pub fn is_noop(&self) -> bool {
        self.evicted.is_empty()
    }
}

/// The reference string that replaces an evicted result.
pub fn eviction_reference(tool_name: &str, tokens: usize, path: &Path) -> String {
    format!(
        "{EVICTED_PREFIX} {tool_name} result (~{tokens} tokens) saved to {}. Read that file if the content is needed again.]",
        path.display()
    )
}

/// Evict old tool results from `messages`.
///
/// Returns the input unchanged when the module is disabled or nothing
/// qualifies. Marked results are persisted before any reference is written,
/// so a failed write leaves the caller's transcript intact.
pub async fn micro_compact(
    messages: &[Message],
    target: Option<usize>,
    budget: &ContextBudget,
    config: &Toggle<EvictionConfig>,
    store: &ToolResultStore,
) -> Result<MicroCompaction, CompactError> {
    if !config.enabled {
        return Ok(MicroCompaction {
            messages: messages.to_vec(),
            ..Default::default()
        });
    }

    let plan = plan_eviction(messages, target, budget, &config.config);
    if plan.is_empty() {
        return Ok(MicroCompaction {
            messages: messages.to_vec(),
            ..Default::default()
        });
    }

    let marked: HashMap<&str, &EvictionCandidate> = plan
        .marked
        .iter()
        .map(|c| (c.tool_use_id.as_str(), c))
        .collect();

    let mut evicted = Vec::with_capacity(plan.marked.len());
    let mut references: HashMap<String, String> = HashMap::new();
    for block in messages.iter().flat_map(|m| m.content.iter()) {
        if let ContentBlock::ToolResult {
            tool_use_id,
            content,
            ..
        } = block
            && let Some(candidate) = marked.get(tool_use_id.as_str())
            && !references.contains_key(tool_use_id)
        {
            let path = store.persist(tool_use_id, content).await?;
            references.insert(
                tool_use_id.clone(),
                eviction_reference(&candidate.tool_name, candidate.tokens, &path),
            );
            evicted.push(EvictedResult {
                tool_use_id: tool_use_id.clone(),
                tool_name: candidate.tool_name.clone(),
                tokens: candidate.tokens,
                path,
            });
        }
    }

    let rewritten = messages
        .iter()
        .map(|message| {
            let touches = message
                .tool_result_ids()
                .any(|id| references.contains_key(id));
            if !touches {
                return message.clone();
            }
            let mut replaced = message.clone();
            replaced.content = message
                .content
                .iter()
                .map(|block| match block {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        is_error,
                        ..
                    } if references.contains_key(tool_use_id) => ContentBlock::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: references[tool_use_id].clone(),
                        is_error: *is_error,
                    },
                    other => other.clone(),
                })
                .collect();
            replaced
        })
        .collect();

    info!(
        "micro-compact: evicted {} tool result(s), ~{} tokens freed",
        evicted.len(),
        plan.tokens_freed
    );
    Ok(MicroCompaction {
        messages: rewritten,
        evicted,
        tokens_freed: plan.tokens_freed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompactionConfig;
    use crate::context::models::ModelLimits;

    /// One token per byte keeps sizes readable.
    fn byte_budget() -> ContextBudget {
        ContextBudget::new("test", &CompactionConfig::default())
            .with_limits(ModelLimits::new(200_000, 64_000))
            .with_tokenizer(|t: &str| t.len())
    }

    fn tool_pair(id: &str, name: &str, size: usize) -> Vec<Message> {
        vec![
            Message::assistant_tool_use(id, name, serde_json::json!({})),
            Message::tool_result(id, "x".repeat(size)),
        ]
    }

    fn four_pairs() -> Vec<Message> {
        let mut messages = vec![Message::user("task")];
        for (i, size) in [50, 4000, 3000, 200].into_iter().enumerate() {
            messages.extend(tool_pair(&format!("t{i}"), "read_file", size));
        }
        messages
    }

    fn keep_two() -> EvictionConfig {
        EvictionConfig::default().with_keep_recent(2)
    }

    #[test]
    fn evicts_oldest_until_under_target() {
        let plan = plan_eviction(&four_pairs(), Some(1_000), &byte_budget(), &keep_two());
        let ids: Vec<_> = plan.marked.iter().map(|c| c.tool_use_id.as_str()).collect();
        // The two recent pairs are exempt, so both older ones go.
        assert_eq!(ids, vec!["t0", "t1"]);
        assert_eq!(plan.tokens_freed, 4_050);
        assert_eq!(plan.total_tool_tokens, 7_250);
    }

    #[test]
    fn stops_once_target_is_met() {
        let plan = plan_eviction(&four_pairs(), Some(7_220), &byte_budget(), &keep_two());
        let ids: Vec<_> = plan.marked.iter().map(|c| c.tool_use_id.as_str()).collect();
        assert_eq!(ids, vec!["t0"]);
        assert_eq!(plan.tokens_freed, 50);
    }

    #[test]
    fn long_transcripts_evict_in_order() {
        let mut messages = vec![Message::user("task")];
        for i in 0..500 {
            let name = if i % 2 == 0 { "bash" } else { "ask_user" };
            messages.extend(tool_pair(&format!("t{i}"), name, 100));
        }
        let plan = plan_eviction(&messages, Some(10_000), &byte_budget(), &keep_two());
        // 250 eligible results of 100 tokens; 150 must go to reach 10k.
        assert_eq!(plan.total_tool_tokens, 25_000);
        assert_eq!(plan.marked.len(), 150);
        assert_eq!(plan.marked[0].tool_use_id, "t0");
        assert_eq!(plan.marked[1].tool_use_id, "t2");
        assert!(plan.marked.iter().all(|c| c.tool_name == "bash"));
    }

    #[test]
    fn non_compactible_tools_are_ignored() {
        let mut messages = vec![Message::user("task")];
        messages.extend(tool_pair("a", "ask_user", 10_000));
        messages.extend(tool_pair("b", "ask_user", 10_000));
        let plan = plan_eviction(
            &messages,
            Some(0),
            &byte_budget(),
            &EvictionConfig::default().with_keep_recent(0),
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn implicit_target_requires_warning_and_minimum() {
        let budget = byte_budget();
        // Far below the warning level: nothing happens even though the
        // default target would mark results.
        let mut messages = vec![Message::user("task")];
        for i in 0..6 {
            messages.extend(tool_pair(&format!("t{i}"), "bash", 15_000));
        }
        assert!(!budget.status(&messages).above_warning);
        assert!(plan_eviction(&messages, None, &budget, &EvictionConfig::default()).is_empty());

        // Above the warning level with enough to free: commits.
        messages.push(Message::user("p".repeat(120_000)));
        assert!(budget.status(&messages).above_warning);
        let plan = plan_eviction(&messages, None, &budget, &EvictionConfig::default());
        let ids: Vec<_> = plan.marked.iter().map(|c| c.tool_use_id.as_str()).collect();
        // 90k of tool output, target 40k: the three oldest go (45k freed).
        assert_eq!(ids, vec!["t0", "t1", "t2"]);

        // Same, but the floor is higher than what can be freed.
        let strict = EvictionConfig::default().with_min_freed(60_000);
        assert!(plan_eviction(&messages, None, &budget, &strict).is_empty());
    }

    #[tokio::test]
    async fn micro_compact_persists_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = ToolResultStore::new(dir.path(), "session-1");
        let messages = four_pairs();

        let out = micro_compact(
            &messages,
            Some(1_000),
            &byte_budget(),
            &Toggle::enabled(keep_two()),
            &store,
        )
        .await
        .unwrap();

        assert_eq!(out.evicted.len(), 2);
        assert_eq!(out.tokens_freed, 4_050);
        assert_eq!(out.messages.len(), messages.len());

        let saved = std::fs::read_to_string(store.path_for("t1")).unwrap();
        assert_eq!(saved.len(), 4_000);

        let replaced = &out.messages[4];
        assert_eq!(replaced.uuid, messages[4].uuid);
        match &replaced.content[0] {
            ContentBlock::ToolResult { content, .. } => {
                assert!(content.starts_with(EVICTED_PREFIX));
                assert!(content.contains("t1.txt"));
            }
            other => panic!("unexpected block {other:?}"),
        }
        // Recent pairs untouched; input slice untouched.
        assert_eq!(out.messages[6], messages[6]);
        assert_eq!(out.messages[8], messages[8]);
        assert!(matches!(
            &messages[4].content[0],
            ContentBlock::ToolResult { content, .. } if content.len() == 4_000
        ));
    }

    #[tokio::test]
    async fn second_pass_skips_already_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let store = ToolResultStore::new(dir.path(), "s");
        let toggle = Toggle::enabled(keep_two());
        let first = micro_compact(&four_pairs(), Some(1_000), &byte_budget(), &toggle, &store)
            .await
            .unwrap();
        let second = micro_compact(&first.messages, Some(1_000), &byte_budget(), &toggle, &store)
            .await
            .unwrap();
        assert!(second.is_noop());
        assert_eq!(second.messages, first.messages);
    }

    #[tokio::test]
    async fn idempotent_without_compactible_results() {
        let dir = tempfile::tempdir().unwrap();
        let store = ToolResultStore::new(dir.path(), "s");
        let toggle = Toggle::enabled(EvictionConfig::default().with_keep_recent(0));
        let messages = vec![
            Message::user("hello"),
            Message::assistant_text("hi"),
            Message::assistant_tool_use("q", "ask_user", serde_json::json!({})),
            Message::tool_result("q", "y".repeat(50_000)),
        ];
        let once = micro_compact(&messages, Some(0), &byte_budget(), &toggle, &store)
            .await
            .unwrap();
        let twice = micro_compact(&once.messages, Some(0), &byte_budget(), &toggle, &store)
            .await
            .unwrap();
        assert_eq!(once.messages, messages);
        assert_eq!(twice.messages, once.messages);
    }

    #[tokio::test]
    async fn disabled_toggle_returns_input() {
        let dir = tempfile::tempdir().unwrap();
        let store = ToolResultStore::new(dir.path(), "s");
        let messages = four_pairs();
        let out = micro_compact(&messages, Some(0), &byte_budget(), &Toggle::disabled(), &store)
            .await
            .unwrap();
        assert!(out.is_noop());
        assert_eq!(out.messages, messages);
        assert!(!store.path_for("t0").exists());
    }
}
