//! Compaction lifecycle hooks.
//!
//! Two events are exposed to user hooks:
//!
//! - **[`HookEvent::PreCompact`]** runs before the summary is requested.
//!   Successful hook output is appended to the summarization instructions,
//!   and every hook contributes a status line for the user.
//! - **[`HookEvent::SessionStart`]** runs after a compaction rebuilt the
//!   transcript. Its output becomes context entries appended to the new
//!   transcript.
//!
//! Hooks never abort a compaction: failures are recorded as unsuccessful
//! [`HookOutcome`]s, and output that doesn't match the expected shape is
//! treated as an empty contribution.
//!
//! [`ExternalHookRunner`] executes shell commands configured in
//! `.cinch/hooks.json`.

use crate::{CompactTrigger, Message, json_schema_for};
use async_trait::async_trait;
use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ── Events and outcomes ────────────────────────────────────────────

/// A hook event with its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    PreCompact {
        trigger: CompactTrigger,
        custom_instructions: Option<String>,
    },
    /// Fired with source `compact` once the new transcript is assembled.
    SessionStart { model: String },
}

impl HookEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HookEvent::PreCompact { .. } => "PreCompact",
            HookEvent::SessionStart { .. } => "SessionStart",
        }
    }

    /// The value hook matchers are compared against.
    pub fn match_query(&self) -> String {
        match self {
            HookEvent::PreCompact { trigger, .. } => trigger.to_string(),
            HookEvent::SessionStart { .. } => "compact".to_string(),
        }
    }
}

/// Result of one hook command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookOutcome {
    pub command: String,
    pub succeeded: bool,
    pub output: String,
}

/// Executes hooks for an event.
#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Run every hook registered for `event`. Each hook is bounded by
    /// `timeout` independently of `cancel`.
    async fn run(
        &self,
        event: &HookEvent,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Vec<HookOutcome>;
}

/// No hooks configured.
pub struct NoHooks;

#[async_trait]
impl HookRunner for NoHooks {
    async fn run(&self, _: &HookEvent, _: Duration, _: &CancellationToken) -> Vec<HookOutcome> {
        Vec::new()
    }
}

// ── PreCompact processing ──────────────────────────────────────────

/// What PreCompact hooks contributed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreCompactResult {
    /// Successful non-empty outputs, joined by a blank line.
    pub new_custom_instructions: Option<String>,
    /// One status line per hook.
    pub user_display_message: Option<String>,
}

pub fn process_pre_compact(outcomes: &[HookOutcome]) -> PreCompactResult {
    if outcomes.is_empty() {
        return PreCompactResult::default();
    }

    let instructions: Vec<&str> = outcomes
        .iter()
        .filter(|o| o.succeeded)
        .map(|o| o.output.trim())
        .filter(|o| !o.is_empty())
        .collect();

    let lines: Vec<String> = outcomes
        .iter()
        .map(|o| {
            let output = o.output.trim();
            match (o.succeeded, output.is_empty()) {
                (true, false) => format!("PreCompact [{}] completed successfully: {output}", o.command),
                (true, true) => format!("PreCompact [{}] completed successfully", o.command),
                (false, false) => format!("PreCompact [{}] failed: {output}", o.command),
                (false, true) => format!("PreCompact [{}] failed", o.command),
            }
        })
        .collect();

    PreCompactResult {
        new_custom_instructions: (!instructions.is_empty()).then(|| instructions.join("\n\n")),
        user_display_message: Some(lines.join("\n")),
    }
}

/// Caller instructions first, hook instructions after.
pub fn merge_instructions(custom: Option<&str>, from_hooks: Option<&str>) -> Option<String> {
    let custom = custom.map(str::trim).filter(|s| !s.is_empty());
    let from_hooks = from_hooks.map(str::trim).filter(|s| !s.is_empty());
    match (custom, from_hooks) {
        (Some(c), Some(h)) => Some(format!("{c}\n\n{h}")),
        (Some(c), None) => Some(c.to_string()),
        (None, Some(h)) => Some(h.to_string()),
        (None, None) => None,
    }
}

// ── SessionStart processing ────────────────────────────────────────

/// Structured SessionStart hook output. Plain-text output is accepted as
/// `additional_context` directly.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SessionStartOutput {
    /// Text appended to the compacted transcript as context.
    #[serde(default)]
    pub additional_context: Option<String>,
}

/// Context entries produced by SessionStart hooks, in hook order.
pub fn session_start_entries(outcomes: &[HookOutcome]) -> Vec<Message> {
    outcomes
        .iter()
        .filter(|o| o.succeeded)
        .filter_map(|o| {
            let context = parse_session_start_output(&o.output)?;
            Some(
                Message::user(format!(
                    "SessionStart:compact hook [{}] additional context:\n{context}",
                    o.command
                ))
                .meta(),
            )
        })
        .collect()
}

/// Extract the context text from one hook's stdout, or `None` when there
/// is nothing usable.
fn parse_session_start_output(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed.starts_with('{') {
        return Some(trimmed.to_string());
    }

    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            warn!("Ignoring malformed SessionStart hook output: {e}");
            return None;
        }
    };
    let schema = json_schema_for::<SessionStartOutput>();
    let validator = match jsonschema::validator_for(&schema) {
        Ok(v) => v,
        Err(e) => {
            warn!("SessionStart output schema failed to compile: {e}");
            return None;
        }
    };
    let errors: Vec<String> = validator
        .iter_errors(&value)
        .map(|e| {
            let path = e.instance_path().to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{path}: {e}")
            }
        })
        .collect();
    if !errors.is_empty() {
        warn!("Ignoring SessionStart hook output: {}", errors.join("; "));
        return None;
    }

    let output: SessionStartOutput = serde_json::from_value(value).ok()?;
    output
        .additional_context
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
}

// ── HookConfig ─────────────────────────────────────────────────────

/// Hook commands, loadable from JSON.
///
/// ```json
/// {
///   "pre_compact": [
///     { "command": "cat .cinch/compact-focus.md", "matcher": "manual" }
///   ],
///   "session_start": [
///     { "command": "git status --short" }
///   ]
/// }
/// ```
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct HookConfig {
    #[serde(default)]
    pub pre_compact: Vec<HookEntry>,
    #[serde(default)]
    pub session_start: Vec<HookEntry>,
}

/// A shell command with an optional matcher.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct HookEntry {
    /// Shell command to execute.
    pub command: String,
    /// When set, the hook only fires if the event's match query (the
    /// trigger for PreCompact, `compact` for SessionStart) contains it.
    #[serde(default)]
    pub matcher: Option<String>,
}

impl HookEntry {
    fn matches(&self, query: &str) -> bool {
        match &self.matcher {
            Some(m) => m.is_empty() || m == "*" || query.contains(m.as_str()),
            None => true,
        }
    }
}

// ── ExternalHookRunner ─────────────────────────────────────────────

/// Runs hook commands through `sh -c`.
///
/// Commands receive context via environment variables:
/// - `CINCH_HOOK_EVENT`: `PreCompact` or `SessionStart`
/// - `CINCH_COMPACT_TRIGGER`: `manual` or `auto` (PreCompact)
/// - `CINCH_CUSTOM_INSTRUCTIONS`: caller instructions, if any (PreCompact)
/// - `CINCH_SESSION_START_SOURCE`: always `compact` (SessionStart)
/// - `CINCH_MODEL`: model identifier (SessionStart)
///
/// Exit code 0 is success; stdout is the hook's output. On failure, stderr
/// (or stdout if stderr is empty) is reported.
pub struct ExternalHookRunner {
    hooks: HookConfig,
    workdir: PathBuf,
}

impl ExternalHookRunner {
    pub fn new(hooks: HookConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            hooks,
            workdir: workdir.into(),
        }
    }

    /// Load hook config from a JSON file. Returns a runner with an empty
    /// config if the file doesn't exist or can't be parsed.
    pub fn load(path: impl AsRef<Path>, workdir: impl Into<PathBuf>) -> Self {
        let hooks = match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("Failed to parse hooks config: {e}");
                HookConfig::default()
            }),
            Err(_) => HookConfig::default(),
        };
        Self::new(hooks, workdir)
    }

    fn entries_for(&self, event: &HookEvent) -> Vec<&HookEntry> {
        let query = event.match_query();
        let entries = match event {
            HookEvent::PreCompact { .. } => &self.hooks.pre_compact,
            HookEvent::SessionStart { .. } => &self.hooks.session_start,
        };
        entries.iter().filter(|e| e.matches(&query)).collect()
    }

    fn env_for(event: &HookEvent) -> Vec<(&'static str, String)> {
        let mut vars = vec![("CINCH_HOOK_EVENT", event.name().to_string())];
        match event {
            HookEvent::PreCompact {
                trigger,
                custom_instructions,
            } => {
                vars.push(("CINCH_COMPACT_TRIGGER", trigger.to_string()));
                vars.push((
                    "CINCH_CUSTOM_INSTRUCTIONS",
                    custom_instructions.clone().unwrap_or_default(),
                ));
            }
            HookEvent::SessionStart { model } => {
                vars.push(("CINCH_SESSION_START_SOURCE", "compact".to_string()));
                vars.push(("CINCH_MODEL", model.clone()));
            }
        }
        vars
    }

    async fn run_one(
        &self,
        entry: &HookEntry,
        env: &[(&'static str, String)],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> HookOutcome {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&entry.command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, val) in env {
            cmd.env(key, val);
        }

        let failed = |output: String| HookOutcome {
            command: entry.command.clone(),
            succeeded: false,
            output,
        };

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return failed(format!("Failed to execute hook command: {e}")),
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return failed("canceled".into()),
            r = tokio::time::timeout(timeout, child.wait_with_output()) => r,
        };

        match result {
            Err(_) => {
                warn!("Hook '{}' timed out after {:?}", entry.command, timeout);
                failed(format!("timed out after {}s", timeout.as_secs()))
            }
            Ok(Err(e)) => failed(format!("Failed to wait for hook: {e}")),
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if output.status.success() {
                    debug!("Hook '{}' succeeded ({} bytes)", entry.command, stdout.len());
                    HookOutcome {
                        command: entry.command.clone(),
                        succeeded: true,
                        output: stdout,
                    }
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    warn!("Hook '{}' exited with {}", entry.command, output.status);
                    failed(if stderr.is_empty() { stdout } else { stderr })
                }
            }
        }
    }
}

#[async_trait]
impl HookRunner for ExternalHookRunner {
    async fn run(
        &self,
        event: &HookEvent,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Vec<HookOutcome> {
        let entries = self.entries_for(event);
        if entries.is_empty() {
            return Vec::new();
        }
        debug!("Running {} {} hook(s)", entries.len(), event.name());
        let env = Self::env_for(event);
        join_all(
            entries
                .into_iter()
                .map(|entry| self.run_one(entry, &env, timeout, cancel)),
        )
        .await
    }
}

// ── Tests ──────────────────────────────────────────────────────────
