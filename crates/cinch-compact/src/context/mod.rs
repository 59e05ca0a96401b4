//! Context window management: budgets, eviction, and session memory.
//!
//! Layered strategies for keeping a transcript inside the model's window,
//! cheapest first:
//!
//! 1. **[`budget`]**: [`ContextBudget`] counts tokens and classifies usage
//!    against the warning, error, auto-compact and blocking levels.
//!
//! 2. **[`eviction`]**: replaces old tool results with references to side
//!    files. No LLM call needed.
//!
//! 3. **[`session_memory`]**: rebuilds a compacted transcript from an
//!    incrementally maintained summary plus the recent tail. No LLM call
//!    either, but only when a usable template exists.
//!
//! Full LLM summarization lives in [`crate::compact`]. [`file_tracker`] and
//! [`usage`] support it: the former restores recently read files after a
//! compaction, the latter reports where the window's tokens go.

pub mod budget;
pub mod eviction;
pub mod file_tracker;
pub mod models;
pub mod session_memory;
pub mod usage;

// Re-export commonly used items at the module level.
pub use budget::{
    BudgetLevel, ContextBudget, DEFAULT_CHARS_PER_TOKEN, QuerySource, TokenBudgetStatus, Tokenizer,
};
pub use eviction::{EvictionConfig, MicroCompaction, ToolResultStore, micro_compact};
pub use file_tracker::ReadFileState;
pub use session_memory::{SessionMemoryStore, SessionMemoryTemplate, Unavailable};
pub use usage::{ContextSources, ContextUsage};
