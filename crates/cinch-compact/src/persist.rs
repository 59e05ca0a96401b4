//! Atomic replace-on-write for persisted artifacts.
//!
//! Readers never take a lock: a file is either the previous complete
//! version or the new complete version, because writers go through a
//! uniquely named temp file in the same directory followed by a rename.

use std::path::{Path, PathBuf};
use tracing::trace;

/// Write `contents` to `path` atomically, creating parent directories.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path_for(path);
    if let Err(e) = tokio::fs::write(&tmp, contents).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    trace!("Wrote {} bytes to {}", contents.len(), path.display());
    Ok(())
}

/// `<name>.<8 hex>.tmp` next to the target.
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".into());
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
    path.with_file_name(format!("{name}.{suffix}.tmp"))
}

/// Reduce an arbitrary key (session id, tool use id) to a safe file stem.
pub fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".into()
    } else {
        cleaned
    }
}
