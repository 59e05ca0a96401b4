//! Token accounting and threshold classification.
//!
//! [`ContextBudget`] answers two questions for a transcript and a model:
//! how many tokens does it occupy, and how close is that to the limits that
//! matter (warning, error, auto-compact, hard blocking). Results are derived
//! on demand from the inputs and the resolved [`CompactionConfig`]; nothing
//! is cached between calls.
//!
//! ```text
//! raw window ─┬─ output reservation (≤ 20k) ──────────── effective window
//!             │                                   ├─ 13k reserve ── auto-compact threshold
//!             │                                   └─ 20k offset ─── warning / error level
//!             └─ 3k offset ──────────────────────────── blocking limit
//! ```

use super::models::{ModelLimits, limits_for_model};
use crate::config::CompactionConfig;
use crate::{ContentBlock, Message};
use std::sync::Arc;
use tracing::debug;

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Headroom kept between the auto-compact threshold and the effective window.
pub const AUTO_COMPACT_RESERVE: usize = 13_000;
/// Distance of the warning level below the window.
pub const WARNING_THRESHOLD_OFFSET: usize = 20_000;
/// Distance of the error level below the window.
pub const ERROR_THRESHOLD_OFFSET: usize = 20_000;
/// Distance of the hard blocking limit below the raw window.
pub const BLOCKING_LIMIT_OFFSET: usize = 3_000;

// ── Tokenizer ──────────────────────────────────────────────────────

/// A pure text-to-token-count function.
///
/// Any `Fn(&str) -> usize` closure is a tokenizer:
///
/// ```
/// use cinch_compact::context::budget::Tokenizer;
///
/// let words = |text: &str| text.split_whitespace().count();
/// assert_eq!(words.count_text("two words"), 2);
/// ```
pub trait Tokenizer: Send + Sync {
    fn count_text(&self, text: &str) -> usize;
}

impl<F> Tokenizer for F
where
    F: Fn(&str) -> usize + Send + Sync,
{
    fn count_text(&self, text: &str) -> usize {
        self(text)
    }
}

/// Character-ratio estimator used when no real tokenizer is injected.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioTokenizer {
    chars_per_token: f64,
}

impl CharRatioTokenizer {
    /// Create an estimator with a calibrated ratio. Non-positive ratios fall
    /// back to [`DEFAULT_CHARS_PER_TOKEN`].
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }
}

impl Default for CharRatioTokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl Tokenizer for CharRatioTokenizer {
    fn count_text(&self, text: &str) -> usize {
        (text.len() as f64 / self.chars_per_token).ceil() as usize
    }
}

/// Tokens in one content block.
pub fn count_block_tokens(tokenizer: &dyn Tokenizer, block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text } => tokenizer.count_text(text),
        ContentBlock::ToolUse { name, input, .. } => {
            tokenizer.count_text(name) + tokenizer.count_text(&input.to_string())
        }
        ContentBlock::ToolResult { content, .. } => tokenizer.count_text(content),
    }
}

/// Tokens in a message sequence: the per-block sum.
pub fn count_tokens(tokenizer: &dyn Tokenizer, messages: &[Message]) -> usize {
    messages
        .iter()
        .flat_map(|m| m.content.iter())
        .map(|b| count_block_tokens(tokenizer, b))
        .sum()
}

// ── Status ─────────────────────────────────────────────────────────

/// Where a request originated. Internal sources never auto-compact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySource {
    /// The interactive main loop.
    MainThread,
    /// A delegated sub-agent.
    SubAgent,
    /// The session-memory updater replaying the transcript.
    SessionMemory,
    /// The summarization call itself.
    Compact,
}

impl QuerySource {
    /// Sources that would recurse into compaction if allowed to trigger it.
    pub fn is_internal(self) -> bool {
        matches!(self, QuerySource::SessionMemory | QuerySource::Compact)
    }
}

/// Threshold classification for a token count. Always recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudgetStatus {
    pub token_count: usize,
    /// Remaining share of the window, 0–100.
    pub percent_left: u8,
    pub above_warning: bool,
    pub above_error: bool,
    pub above_auto_compact_threshold: bool,
    pub at_blocking_limit: bool,
}

/// The most severe threshold crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BudgetLevel {
    Normal,
    Warning,
    Error,
    AutoCompactDue,
    Blocking,
}

impl std::fmt::Display for BudgetLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetLevel::Normal => write!(f, "normal"),
            BudgetLevel::Warning => write!(f, "warning"),
            BudgetLevel::Error => write!(f, "error"),
            BudgetLevel::AutoCompactDue => write!(f, "auto-compact due"),
            BudgetLevel::Blocking => write!(f, "blocking"),
        }
    }
}

impl TokenBudgetStatus {
    pub fn level(&self) -> BudgetLevel {
        if self.at_blocking_limit {
            BudgetLevel::Blocking
        } else if self.above_auto_compact_threshold {
            BudgetLevel::AutoCompactDue
        } else if self.above_error {
            BudgetLevel::Error
        } else if self.above_warning {
            BudgetLevel::Warning
        } else {
            BudgetLevel::Normal
        }
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({}% left, {})",
            self.token_count,
            self.percent_left,
            self.level()
        )
    }
}

// ── ContextBudget ──────────────────────────────────────────────────

/// Token accountant for one model under one resolved configuration.
///
/// # Example
///
/// ```
/// use cinch_compact::config::CompactionConfig;
/// use cinch_compact::context::ContextBudget;
/// use cinch_compact::context::models::ModelLimits;
///
/// let config = CompactionConfig::default();
/// let budget = ContextBudget::new("anthropic/claude-sonnet-4", &config)
///     .with_limits(ModelLimits::new(200_000, 64_000));
///
/// assert_eq!(budget.effective_context_window(), 180_000);
/// assert_eq!(budget.auto_compact_threshold(), 167_000);
/// assert!(budget.classify(170_000).above_auto_compact_threshold);
/// ```
#[derive(Clone)]
pub struct ContextBudget {
    model: String,
    limits: ModelLimits,
    auto_compact_enabled: bool,
    pct_override: Option<f64>,
    blocking_override: Option<usize>,
    tokenizer: Arc<dyn Tokenizer>,
}

impl std::fmt::Debug for ContextBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBudget")
            .field("model", &self.model)
            .field("limits", &self.limits)
            .field("auto_compact_enabled", &self.auto_compact_enabled)
            .field("pct_override", &self.pct_override)
            .field("blocking_override", &self.blocking_override)
            .finish_non_exhaustive()
    }
}

impl ContextBudget {
    /// Budget for `model` using the built-in limits table and the default
    /// character-ratio tokenizer.
    pub fn new(model: impl Into<String>, config: &CompactionConfig) -> Self {
        let model = model.into();
        Self {
            limits: limits_for_model(&model),
            model,
            auto_compact_enabled: config.auto_compact_enabled,
            pct_override: config.auto_compact_pct_override,
            blocking_override: config.blocking_limit_override,
            tokenizer: Arc::new(CharRatioTokenizer::default()),
        }
    }

    /// Override the model limits (e.g. from a provider's model listing).
    pub fn with_limits(mut self, limits: ModelLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Inject a real tokenizer.
    pub fn with_tokenizer(mut self, tokenizer: impl Tokenizer + 'static) -> Self {
        self.tokenizer = Arc::new(tokenizer);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn limits(&self) -> ModelLimits {
        self.limits
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    pub fn auto_compact_enabled(&self) -> bool {
        self.auto_compact_enabled
    }

    /// Tokens in `messages`. Deterministic for fixed inputs.
    pub fn count_tokens(&self, messages: &[Message]) -> usize {
        count_tokens(self.tokenizer.as_ref(), messages)
    }

    pub fn count_text(&self, text: &str) -> usize {
        self.tokenizer.count_text(text)
    }

    pub fn raw_context_window(&self) -> usize {
        self.limits.context_window
    }

    /// Raw window minus the (capped) output reservation.
    pub fn effective_context_window(&self) -> usize {
        self.limits
            .context_window
            .saturating_sub(self.limits.output_reservation())
    }

    /// Effective window minus [`AUTO_COMPACT_RESERVE`], lowered further by a
    /// percentage override. An override can only tighten the threshold.
    pub fn auto_compact_threshold(&self) -> usize {
        let effective = self.effective_context_window();
        let threshold = effective.saturating_sub(AUTO_COMPACT_RESERVE);
        match self.pct_override {
            Some(pct) if pct > 0.0 && pct <= 100.0 => {
                let overridden = (effective as f64 * (pct / 100.0)).floor() as usize;
                overridden.min(threshold)
            }
            _ => threshold,
        }
    }

    /// Raw window minus [`BLOCKING_LIMIT_OFFSET`], or the operator override.
    pub fn blocking_limit(&self) -> usize {
        self.blocking_override.unwrap_or_else(|| {
            self.limits
                .context_window
                .saturating_sub(BLOCKING_LIMIT_OFFSET)
        })
    }

    /// The window percentages and warning levels are measured against: the
    /// auto-compact threshold while auto-compact is on, else the effective
    /// window.
    fn reference_window(&self) -> usize {
        if self.auto_compact_enabled {
            self.auto_compact_threshold()
        } else {
            self.effective_context_window()
        }
    }

    /// Classify a token count against every threshold.
    pub fn classify(&self, token_count: usize) -> TokenBudgetStatus {
        let window = self.reference_window();
        let percent_left = if window == 0 {
            0
        } else {
            let left = (window as f64 - token_count as f64) / window as f64;
            (left.max(0.0) * 100.0).round().min(100.0) as u8
        };

        let warning_level = window.saturating_sub(WARNING_THRESHOLD_OFFSET);
        let error_level = window.saturating_sub(ERROR_THRESHOLD_OFFSET);

        TokenBudgetStatus {
            token_count,
            percent_left,
            above_warning: token_count >= warning_level,
            above_error: token_count >= error_level,
            above_auto_compact_threshold: self.auto_compact_enabled
                && token_count >= self.auto_compact_threshold(),
            at_blocking_limit: token_count >= self.blocking_limit(),
        }
    }

    /// Count and classify in one step.
    pub fn status(&self, messages: &[Message]) -> TokenBudgetStatus {
        self.classify(self.count_tokens(messages))
    }

    /// Whether the automatic trigger should fire after this turn.
    pub fn should_auto_compact(&self, messages: &[Message], source: QuerySource) -> bool {
        if source.is_internal() || !self.auto_compact_enabled {
            return false;
        }
        let token_count = self.count_tokens(messages);
        debug!(
            "autocompact: tokens={} threshold={} effective_window={}",
            token_count,
            self.auto_compact_threshold(),
            self.effective_context_window()
        );
        self.classify(token_count).above_auto_compact_threshold
    }
}
