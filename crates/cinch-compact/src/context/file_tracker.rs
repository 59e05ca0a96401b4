//! Recently-read file state carried across a compaction.
//!
//! The summary loses the exact contents of files the agent was working
//! with. [`ReadFileState`] records file paths extracted from tool call
//! arguments; when a compaction commits, the tracker is snapshotted and
//! cleared, and the most recent files are re-read from disk and attached
//! to the new transcript.

use crate::{ContentBlock, Message};
use futures::future::join_all;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on tracked paths.
pub const MAX_TRACKED_FILES: usize = 100;
/// Characters kept from each restored file.
pub const MAX_RESTORED_FILE_CHARS: usize = 40_000;

/// The type of file access recorded by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccessType {
    Read,
    Write,
}

impl std::fmt::Display for FileAccessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileAccessType::Read => write!(f, "read"),
            FileAccessType::Write => write!(f, "write"),
        }
    }
}

/// One tracked file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAccess {
    pub path: PathBuf,
    pub access_type: FileAccessType,
}

/// Paths the session has touched, oldest first, deduplicated by path.
///
/// Shared between the agent loop (which records) and the compactor (which
/// snapshots), so interior mutability is used.
#[derive(Debug)]
pub struct ReadFileState {
    recent: Mutex<VecDeque<FileAccess>>,
    capacity: usize,
}

impl Default for ReadFileState {
    fn default() -> Self {
        Self::new(MAX_TRACKED_FILES)
    }
}

impl ReadFileState {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(MAX_TRACKED_FILES))),
            capacity,
        }
    }

    /// Record an access. A path already tracked moves to the newest slot.
    pub fn record(&self, path: impl Into<PathBuf>, access_type: FileAccessType) {
        if self.capacity == 0 {
            return;
        }
        let path = path.into();
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.retain(|f| f.path != path);
        recent.push_back(FileAccess { path, access_type });
        while recent.len() > self.capacity {
            recent.pop_front();
        }
    }

    pub fn record_read(&self, path: impl Into<PathBuf>) {
        self.record(path, FileAccessType::Read);
    }

    /// Record a file access from a tool call.
    ///
    /// Recognized tools:
    /// - `read_file`, `text_editor` with `command: "view"` → read
    /// - `write_file`, `edit_file`, other `text_editor` commands → write
    pub fn record_tool_access(&self, tool_name: &str, arguments: &serde_json::Value) {
        let access_type = match tool_name {
            "read_file" => FileAccessType::Read,
            "write_file" | "edit_file" => FileAccessType::Write,
            "text_editor" => match arguments.get("command").and_then(|c| c.as_str()) {
                Some("view") => FileAccessType::Read,
                _ => FileAccessType::Write,
            },
            _ => return,
        };
        if let Some(path) = extract_path(arguments) {
            self.record(path, access_type);
        }
    }

    /// Rebuild the tracker from the tool calls in a transcript.
    pub fn record_from_transcript(&self, messages: &[Message]) {
        for block in messages.iter().flat_map(|m| m.content.iter()) {
            if let ContentBlock::ToolUse { name, input, .. } = block {
                self.record_tool_access(name, input);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.recent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the tracked files, newest first, leaving the tracker empty.
    pub fn snapshot_and_clear(&self) -> Vec<FileAccess> {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot: Vec<FileAccess> = recent.drain(..).rev().collect();
        snapshot
    }
}

/// Extract a file path from JSON tool arguments.
fn extract_path(arguments: &serde_json::Value) -> Option<String> {
    let obj = arguments.as_object()?;
    for key in &["path", "file_path", "file"] {
        if let Some(v) = obj.get(*key).and_then(|v| v.as_str())
            && !v.is_empty()
        {
            return Some(v.to_string());
        }
    }
    None
}

/// Re-read up to `max_files` of the snapshot (newest first) and wrap each in
/// a bookkeeping message. Files that no longer exist are skipped; reads run
/// concurrently and stop as soon as `cancel` fires.
pub async fn restore_recent_files(
    snapshot: &[FileAccess],
    workdir: &Path,
    max_files: usize,
    max_chars: usize,
    cancel: &CancellationToken,
) -> Vec<Message> {
    let reads = snapshot.iter().take(max_files).map(|access| async move {
        let full = if access.path.is_absolute() {
            access.path.clone()
        } else {
            workdir.join(&access.path)
        };
        let content = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            r = tokio::fs::read_to_string(&full) => r,
        };
        match content {
            Ok(content) => Some(restored_file_message(&access.path, &content, max_chars)),
            Err(e) => {
                debug!("Skipping restore of {}: {e}", access.path.display());
                None
            }
        }
    });

    let restored: Vec<Message> = join_all(reads).await.into_iter().flatten().collect();
    if cancel.is_cancelled() {
        warn!("File restoration interrupted by cancellation");
    }
    restored
}

fn restored_file_message(path: &Path, content: &str, max_chars: usize) -> Message {
    let (body, truncated) = truncate_chars(content, max_chars);
    let note = if truncated {
        format!("\n[Truncated to {max_chars} characters. Read the file for the rest.]")
    } else {
        String::new()
    };
    Message::user(format!(
        "Contents of {} (re-read after compaction):\n```\n{body}\n```{note}",
        path.display()
    ))
    .meta()
}

/// Truncate on a character boundary.
fn truncate_chars(s: &str, max_chars: usize) -> (&str, bool) {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => (s.get(..idx).unwrap_or(s), true),
        None => (s, false),
    }
}
