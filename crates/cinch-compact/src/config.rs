//! Resolved compaction configuration.
//!
//! Every feature gate and operator override is read exactly once per
//! request into a [`CompactionConfig`], which is then passed down the call
//! chain. Nothing below this module touches the environment.
//!
//! # Operator environment
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `DISABLE_COMPACT` | Disables manual and automatic compaction |
//! | `DISABLE_AUTO_COMPACT` | Disables only the automatic trigger |
//! | `DISABLE_MICROCOMPACT` | Disables tool-output eviction |
//! | `CINCH_AUTOCOMPACT_PCT_OVERRIDE` | Lowers the auto-compact threshold to a percentage of the effective window, `(0, 100]` |
//! | `CINCH_BLOCKING_LIMIT_OVERRIDE` | Absolute blocking limit in tokens (positive integer) |
//!
//! Persistent preferences live in `.cinch/settings.json` (see
//! [`CompactSettings`]).

use crate::api::retry::RetryConfig;
use crate::context::eviction::EvictionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const ENV_DISABLE_COMPACT: &str = "DISABLE_COMPACT";
pub const ENV_DISABLE_AUTO_COMPACT: &str = "DISABLE_AUTO_COMPACT";
pub const ENV_DISABLE_MICROCOMPACT: &str = "DISABLE_MICROCOMPACT";
pub const ENV_AUTOCOMPACT_PCT_OVERRIDE: &str = "CINCH_AUTOCOMPACT_PCT_OVERRIDE";
pub const ENV_BLOCKING_LIMIT_OVERRIDE: &str = "CINCH_BLOCKING_LIMIT_OVERRIDE";

/// Default data directory for persisted artifacts.
pub const DEFAULT_DATA_DIR: &str = ".cinch";

/// Default bound on a single hook command.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(60);

/// Files re-attached after an LLM compaction.
pub const DEFAULT_MAX_RESTORED_FILES: usize = 5;

// ── Toggle ─────────────────────────────────────────────────────────

/// A module that can be switched off independently of its settings.
#[derive(Debug, Clone)]
pub struct Toggle<T: Default> {
    /// Whether this module is active.
    pub enabled: bool,
    /// Module-specific configuration.
    pub config: T,
}

impl<T: Default> Toggle<T> {
    /// Create a disabled instance with default inner config.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: T::default(),
        }
    }

    pub fn enabled(config: T) -> Self {
        Self {
            enabled: true,
            config,
        }
    }
}

impl<T: Default> Default for Toggle<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            config: T::default(),
        }
    }
}

// ── Settings file ──────────────────────────────────────────────────

/// User preferences loaded from `.cinch/settings.json`. Every field is
/// optional; unset fields keep the built-in default.
///
/// ```json
/// {
///   "auto_compact_enabled": true,
///   "session_memory": true,
///   "streaming_retry": true,
///   "keep_recent_tool_results": 3
/// }
/// ```
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct CompactSettings {
    pub auto_compact_enabled: Option<bool>,
    pub session_memory: Option<bool>,
    pub cache_sharing: Option<bool>,
    pub streaming_retry: Option<bool>,
    pub tool_aware_summary: Option<bool>,
    pub max_attempts: Option<u32>,
    pub keep_recent_tool_results: Option<usize>,
    pub max_restored_files: Option<usize>,
    pub hook_timeout_secs: Option<u64>,
    pub data_dir: Option<PathBuf>,
}

impl CompactSettings {
    /// Load settings from a JSON file. Returns defaults if the file doesn't
    /// exist or can't be parsed.
    pub fn load(path: impl AsRef<Path>) -> Self {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("Failed to parse compaction settings: {e}");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

// ── Resolved config ────────────────────────────────────────────────

/// What a second compaction request does while one is in flight for the
/// same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InFlightPolicy {
    /// Queue behind the running compaction.
    #[default]
    Wait,
    /// Fail immediately with `CompactionInFlight`.
    Reject,
}

/// Configuration resolved once per request.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Master switch (`DISABLE_COMPACT`).
    pub compact_enabled: bool,
    /// Automatic trigger after each turn.
    pub auto_compact_enabled: bool,
    /// Operator percentage for the auto-compact threshold, already validated.
    pub auto_compact_pct_override: Option<f64>,
    /// Operator absolute blocking limit, already validated.
    pub blocking_limit_override: Option<usize>,
    /// Tool-output eviction before summarization.
    pub micro_compact: Toggle<EvictionConfig>,
    /// Session-memory fast path.
    pub session_memory: bool,
    /// Single-turn cache-sharing request before the streaming path.
    pub cache_sharing: bool,
    /// Offer editor and external tools to the summarizer on capable models.
    pub tool_aware_summary: bool,
    pub retry: RetryConfig,
    pub hook_timeout: Duration,
    pub max_restored_files: usize,
    pub in_flight: InFlightPolicy,
    /// Root for evicted tool output and session-memory templates.
    pub data_dir: PathBuf,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            compact_enabled: true,
            auto_compact_enabled: true,
            auto_compact_pct_override: None,
            blocking_limit_override: None,
            micro_compact: Toggle::default(),
            session_memory: true,
            cache_sharing: false,
            tool_aware_summary: false,
            retry: RetryConfig::default(),
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
            max_restored_files: DEFAULT_MAX_RESTORED_FILES,
            in_flight: InFlightPolicy::default(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        }
    }
}

impl CompactionConfig {
    /// Resolve from the process environment with default settings.
    pub fn from_env() -> Self {
        Self::resolve(&CompactSettings::default(), |key| std::env::var(key).ok())
    }

    /// Resolve from a settings file plus the process environment.
    pub fn from_env_and_settings(settings: &CompactSettings) -> Self {
        Self::resolve(settings, |key| std::env::var(key).ok())
    }

    /// Resolve from settings and an arbitrary variable lookup.
    pub fn resolve(settings: &CompactSettings, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let compact_enabled = !is_truthy(lookup(ENV_DISABLE_COMPACT).as_deref());
        let auto_compact_enabled = compact_enabled
            && !is_truthy(lookup(ENV_DISABLE_AUTO_COMPACT).as_deref())
            && settings.auto_compact_enabled.unwrap_or(true);

        let mut eviction = EvictionConfig::default();
        if let Some(keep) = settings.keep_recent_tool_results {
            eviction.keep_recent = keep;
        }
        let micro_compact = Toggle {
            enabled: !is_truthy(lookup(ENV_DISABLE_MICROCOMPACT).as_deref()),
            config: eviction,
        };

        let mut retry = RetryConfig {
            enabled: settings.streaming_retry.unwrap_or(defaults.retry.enabled),
            ..RetryConfig::default()
        };
        if let Some(attempts) = settings.max_attempts {
            retry.max_attempts = attempts;
        }

        let config = Self {
            compact_enabled,
            auto_compact_enabled,
            auto_compact_pct_override: lookup(ENV_AUTOCOMPACT_PCT_OVERRIDE)
                .as_deref()
                .and_then(parse_pct_override),
            blocking_limit_override: lookup(ENV_BLOCKING_LIMIT_OVERRIDE)
                .as_deref()
                .and_then(parse_blocking_override),
            micro_compact,
            session_memory: settings.session_memory.unwrap_or(defaults.session_memory),
            cache_sharing: settings.cache_sharing.unwrap_or(defaults.cache_sharing),
            tool_aware_summary: settings
                .tool_aware_summary
                .unwrap_or(defaults.tool_aware_summary),
            retry,
            hook_timeout: settings
                .hook_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.hook_timeout),
            max_restored_files: settings
                .max_restored_files
                .unwrap_or(defaults.max_restored_files),
            in_flight: defaults.in_flight,
            data_dir: settings.data_dir.clone().unwrap_or(defaults.data_dir),
        };
        debug!(
            "compaction config: enabled={}, auto={}, micro={}, session_memory={}, attempts={}",
            config.compact_enabled,
            config.auto_compact_enabled,
            config.micro_compact.enabled,
            config.session_memory,
            config.retry.attempts(),
        );
        config
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_in_flight(mut self, policy: InFlightPolicy) -> Self {
        self.in_flight = policy;
        self
    }

    pub fn with_session_memory(mut self, enabled: bool) -> Self {
        self.session_memory = enabled;
        self
    }

    pub fn with_cache_sharing(mut self, enabled: bool) -> Self {
        self.cache_sharing = enabled;
        self
    }

    pub fn with_micro_compact(mut self, micro: Toggle<EvictionConfig>) -> Self {
        self.micro_compact = micro;
        self
    }

    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }
}

/// `1`, `true`, `yes`, `on` (case-insensitive, surrounding whitespace ignored).
pub fn is_truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

/// A finite percentage in `(0, 100]`.
fn parse_pct_override(raw: &str) -> Option<f64> {
    let pct: f64 = raw.trim().parse().ok()?;
    (pct.is_finite() && pct > 0.0 && pct <= 100.0).then_some(pct)
}

/// A positive integer. Like a lenient integer parse, trailing garbage after
/// the leading digits is ignored.
fn parse_blocking_override(raw: &str) -> Option<usize> {
    let digits: String = raw.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    let value: usize = digits.parse().ok()?;
    (value > 0).then_some(value)
}
