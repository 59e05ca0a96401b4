//! Session context re-attached after an LLM compaction: the agent's
//! `memory/MEMORY.md` index and the persisted todo list.

use crate::Message;
use crate::persist::sanitize_key;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lines of MEMORY.md carried into the compacted transcript.
pub const MAX_MEMORY_LINES: usize = 200;

/// Read a file unless `cancel` fires first. Missing files are `None`.
async fn read_optional(path: &Path, cancel: &CancellationToken) -> Option<String> {
    let read = tokio::select! {
        biased;
        _ = cancel.cancelled() => return None,
        r = tokio::fs::read_to_string(path) => r,
    };
    match read {
        Ok(content) => Some(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            debug!("Failed to read {}: {e}", path.display());
            None
        }
    }
}

// ── Agent memory ───────────────────────────────────────────────────

pub fn memory_index_path(workdir: &Path) -> PathBuf {
    workdir.join("memory").join("MEMORY.md")
}

/// Truncate to `max_lines`, noting how much was cut.
fn truncate_memory(content: &str, max_lines: usize) -> String {
    let total = content.lines().count();
    if total <= max_lines {
        return content.trim_end().to_string();
    }
    let kept: Vec<&str> = content.lines().take(max_lines).collect();
    format!(
        "{}\n\n[MEMORY.md truncated at {max_lines} of {total} lines. Read the full file for more.]",
        kept.join("\n")
    )
}

/// The MEMORY.md index as a bookkeeping message, if present and non-empty.
pub async fn agent_memory(workdir: &Path, cancel: &CancellationToken) -> Option<Message> {
    let content = read_optional(&memory_index_path(workdir), cancel).await?;
    if content.trim().is_empty() {
        return None;
    }
    Some(
        Message::user(format!(
            "Agent memory (memory/MEMORY.md):\n{}",
            truncate_memory(&content, MAX_MEMORY_LINES)
        ))
        .meta(),
    )
}

// ── Todos ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

impl fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TodoStatus::Pending => write!(f, "[ ]"),
            TodoStatus::InProgress => write!(f, "[~]"),
            TodoStatus::Completed => write!(f, "[x]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TodoItem {
    pub task: String,
    pub status: TodoStatus,
}

pub fn todo_path(data_dir: &Path, session_id: &str) -> PathBuf {
    data_dir
        .join("todos")
        .join(format!("{}.json", sanitize_key(session_id)))
}

fn format_todos(items: &[TodoItem]) -> String {
    let mut out = String::from("Todo list:\n");
    for (i, item) in items.iter().enumerate() {
        out.push_str(&format!("  {}. {} {}\n", i + 1, item.status, item.task));
    }
    out
}

/// The session's open todo list as a bookkeeping message. Absent, empty, or
/// fully completed lists contribute nothing.
pub async fn todo_context(
    data_dir: &Path,
    session_id: &str,
    cancel: &CancellationToken,
) -> Option<Message> {
    let path = todo_path(data_dir, session_id);
    let raw = read_optional(&path, cancel).await?;
    let items: Vec<TodoItem> = match serde_json::from_str(&raw) {
        Ok(items) => items,
        Err(e) => {
            warn!("Ignoring malformed todo list {}: {e}", path.display());
            return None;
        }
    };
    if items.iter().all(|i| i.status == TodoStatus::Completed) {
        return None;
    }
    Some(Message::user(format_todos(&items)).meta())
}
