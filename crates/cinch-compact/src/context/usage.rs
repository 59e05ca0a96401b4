//! Context usage report: where the window's tokens go.
//!
//! Breaks the window down into categories (system prompt, tools, memory
//! files, messages), reserves the compaction buffer, and reports the rest
//! as free space. Category counts run concurrently; memory files are read
//! from disk.

use super::budget::ContextBudget;
use crate::{Message, ToolDef, UsageInfo};
use futures::future::join_all;
use std::path::PathBuf;
use tracing::debug;

/// Buffer reserved for a manual compaction when auto-compact is off.
pub const COMPACT_BUFFER: usize = 3_000;

pub const SYSTEM_PROMPT_LABEL: &str = "System prompt";
pub const SYSTEM_TOOLS_LABEL: &str = "System tools";
pub const MCP_TOOLS_LABEL: &str = "MCP tools";
pub const MEMORY_FILES_LABEL: &str = "Memory files";
pub const MESSAGES_LABEL: &str = "Messages";
pub const AUTOCOMPACT_BUFFER_LABEL: &str = "Autocompact buffer";
pub const COMPACT_BUFFER_LABEL: &str = "Compact buffer";
pub const FREE_SPACE_LABEL: &str = "Free space";

const MCP_TOOL_PREFIX: &str = "mcp__";

/// Inputs outside the transcript that occupy the window.
#[derive(Debug, Clone, Default)]
pub struct ContextSources {
    pub system_prompt: String,
    pub tools: Vec<ToolDef>,
    /// Instruction/memory files loaded into the system message.
    pub memory_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageCategory {
    pub name: &'static str,
    pub tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryFileUsage {
    pub path: PathBuf,
    pub tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpToolUsage {
    pub name: String,
    pub server: String,
    pub tokens: usize,
}

/// A point-in-time breakdown of window usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextUsage {
    pub model: String,
    /// Content categories, then the buffer, then free space.
    pub categories: Vec<UsageCategory>,
    /// Tokens in use: the API-reported prompt size when known, otherwise
    /// the sum of the content categories.
    pub total_tokens: usize,
    pub raw_max_tokens: usize,
    /// `total_tokens` as a share of the raw window, 0–100.
    pub percentage: u8,
    pub memory_files: Vec<MemoryFileUsage>,
    pub mcp_tools: Vec<McpToolUsage>,
}

impl ContextUsage {
    /// Compute the report. `api_usage` from the last response overrides the
    /// estimated total when it carries a prompt size.
    pub async fn calculate(
        budget: &ContextBudget,
        messages: &[Message],
        sources: &ContextSources,
        api_usage: Option<&UsageInfo>,
    ) -> Self {
        let (system_prompt_tokens, (system_tool_tokens, mcp_tools), memory_files, message_tokens) = tokio::join!(
            async { budget.count_text(&sources.system_prompt) },
            async { count_tool_tokens(budget, &sources.tools) },
            count_memory_files(budget, &sources.memory_files),
            async { budget.count_tokens(messages) },
        );
        let mcp_tool_tokens: usize = mcp_tools.iter().map(|t| t.tokens).sum();
        let memory_file_tokens: usize = memory_files.iter().map(|f| f.tokens).sum();

        let mut categories: Vec<UsageCategory> = [
            (SYSTEM_PROMPT_LABEL, system_prompt_tokens),
            (SYSTEM_TOOLS_LABEL, system_tool_tokens),
            (MCP_TOOLS_LABEL, mcp_tool_tokens),
            (MEMORY_FILES_LABEL, memory_file_tokens),
            (MESSAGES_LABEL, message_tokens),
        ]
        .into_iter()
        .filter(|(_, tokens)| *tokens > 0)
        .map(|(name, tokens)| UsageCategory { name, tokens })
        .collect();

        let consumed: usize = categories.iter().map(|c| c.tokens).sum();
        let raw = budget.raw_context_window();

        let buffer = if budget.auto_compact_enabled() {
            UsageCategory {
                name: AUTOCOMPACT_BUFFER_LABEL,
                tokens: raw.saturating_sub(budget.auto_compact_threshold()),
            }
        } else {
            UsageCategory {
                name: COMPACT_BUFFER_LABEL,
                tokens: COMPACT_BUFFER,
            }
        };
        let free = raw.saturating_sub(consumed).saturating_sub(buffer.tokens);
        categories.push(buffer);
        categories.push(UsageCategory {
            name: FREE_SPACE_LABEL,
            tokens: free,
        });

        let total_tokens = api_usage
            .and_then(|u| u.prompt_tokens)
            .map(|t| t as usize)
            .unwrap_or(consumed);
        let percentage = if raw == 0 {
            100
        } else {
            ((total_tokens as f64 / raw as f64) * 100.0).round().min(100.0) as u8
        };
        debug!("context usage: {total_tokens}/{raw} tokens ({percentage}%)");

        Self {
            model: budget.model().to_string(),
            categories,
            total_tokens,
            raw_max_tokens: raw,
            percentage,
            memory_files,
            mcp_tools,
        }
    }

    pub fn category(&self, name: &str) -> Option<&UsageCategory> {
        self.categories.iter().find(|c| c.name == name)
    }

    fn pct_of_window(&self, tokens: usize) -> String {
        if self.raw_max_tokens == 0 {
            return "0.0".into();
        }
        format!("{:.1}", tokens as f64 / self.raw_max_tokens as f64 * 100.0)
    }

    /// Render as Markdown.
    pub fn to_markdown(&self) -> String {
        let mut text = String::from("## Context Usage\n\n");
        text.push_str(&format!("**Model:** {}  \n", self.model));
        text.push_str(&format!(
            "**Tokens:** {} / {} ({}%)\n\n",
            format_token_count(self.total_tokens),
            format_token_count(self.raw_max_tokens),
            self.percentage
        ));

        let is_trailer = |name: &str| {
            name == FREE_SPACE_LABEL || name == AUTOCOMPACT_BUFFER_LABEL || name == COMPACT_BUFFER_LABEL
        };
        let active: Vec<&UsageCategory> = self
            .categories
            .iter()
            .filter(|c| c.tokens > 0 && !is_trailer(c.name))
            .collect();

        if !active.is_empty() {
            text.push_str("### Estimated usage by category\n\n");
            text.push_str("| Category | Tokens | Percentage |\n");
            text.push_str("|----------|--------|------------|\n");
            let trailers = [FREE_SPACE_LABEL, AUTOCOMPACT_BUFFER_LABEL, COMPACT_BUFFER_LABEL]
                .into_iter()
                .filter_map(|name| self.category(name));
            for cat in active.into_iter().chain(trailers) {
                if cat.tokens == 0 {
                    continue;
                }
                text.push_str(&format!(
                    "| {} | {} | {}% |\n",
                    cat.name,
                    format_token_count(cat.tokens),
                    self.pct_of_window(cat.tokens)
                ));
            }
            text.push('\n');
        }

        if !self.mcp_tools.is_empty() {
            text.push_str("### MCP Tools\n\n");
            text.push_str("| Tool | Server | Tokens |\n");
            text.push_str("|------|--------|--------|\n");
            for tool in &self.mcp_tools {
                text.push_str(&format!(
                    "| {} | {} | {} |\n",
                    tool.name,
                    tool.server,
                    format_token_count(tool.tokens)
                ));
            }
            text.push('\n');
        }

        if !self.memory_files.is_empty() {
            text.push_str("### Memory Files\n\n");
            text.push_str("| Path | Tokens |\n");
            text.push_str("|------|--------|\n");
            for file in &self.memory_files {
                text.push_str(&format!(
                    "| {} | {} |\n",
                    file.path.display(),
                    format_token_count(file.tokens)
                ));
            }
            text.push('\n');
        }

        text
    }
}

fn tool_tokens(budget: &ContextBudget, tool: &ToolDef) -> usize {
    budget.count_text(&serde_json::to_string(tool).unwrap_or_default())
}

/// Split tool definitions into built-in tokens and per-MCP-tool usage.
fn count_tool_tokens(budget: &ContextBudget, tools: &[ToolDef]) -> (usize, Vec<McpToolUsage>) {
    let mut builtin = 0;
    let mut mcp = Vec::new();
    for tool in tools {
        let tokens = tool_tokens(budget, tool);
        match tool.name().strip_prefix(MCP_TOOL_PREFIX) {
            Some(rest) => {
                let server = rest.split("__").next().unwrap_or(rest).to_string();
                mcp.push(McpToolUsage {
                    name: tool.name().to_string(),
                    server,
                    tokens,
                });
            }
            None => builtin += tokens,
        }
    }
    (builtin, mcp)
}

/// Read and count memory files concurrently. Unreadable files are skipped.
async fn count_memory_files(budget: &ContextBudget, paths: &[PathBuf]) -> Vec<MemoryFileUsage> {
    let reads = paths.iter().map(|path| async move {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Some(MemoryFileUsage {
                path: path.clone(),
                tokens: budget.count_text(&content),
            }),
            Err(e) => {
                debug!("Skipping memory file {}: {e}", path.display());
                None
            }
        }
    });
    join_all(reads).await.into_iter().flatten().collect()
}

/// `950`, `1.5k`, `12k`.
pub fn format_token_count(n: usize) -> String {
    if n < 1000 {
        return n.to_string();
    }
    let k = format!("{:.1}", n as f64 / 1000.0);
    match k.strip_suffix(".0") {
        Some(whole) => format!("{whole}k"),
        None => format!("{k}k"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompactionConfig;
    use crate::context::models::ModelLimits;

    fn budget(auto: bool) -> ContextBudget {
        let config = CompactionConfig {
            auto_compact_enabled: auto,
            ..CompactionConfig::default()
        };
        ContextBudget::new("test-model", &config)
            .with_limits(ModelLimits::new(200_000, 64_000))
            .with_tokenizer(|t: &str| t.len())
    }

    #[test]
    fn token_count_formatting() {
        assert_eq!(format_token_count(0), "0");
        assert_eq!(format_token_count(999), "999");
        assert_eq!(format_token_count(1000), "1k");
        assert_eq!(format_token_count(1500), "1.5k");
        assert_eq!(format_token_count(12_000), "12k");
        assert_eq!(format_token_count(200_000), "200k");
    }

    #[tokio::test]
    async fn categories_and_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let memory = dir.path().join("MEMORY.md");
        std::fs::write(&memory, "x".repeat(300)).unwrap();

        let sources = ContextSources {
            system_prompt: "p".repeat(1_000),
            tools: vec![
                ToolDef::new("bash", "run", serde_json::json!({})),
                ToolDef::new("mcp__github__create_issue", "issue", serde_json::json!({})),
            ],
            memory_files: vec![memory.clone(), dir.path().join("missing.md")],
        };
        let messages = vec![Message::user("m".repeat(5_000))];

        let usage = ContextUsage::calculate(&budget(true), &messages, &sources, None).await;
        assert_eq!(usage.category(SYSTEM_PROMPT_LABEL).unwrap().tokens, 1_000);
        assert_eq!(usage.category(MESSAGES_LABEL).unwrap().tokens, 5_000);
        assert_eq!(usage.category(MEMORY_FILES_LABEL).unwrap().tokens, 300);
        assert_eq!(usage.memory_files.len(), 1);
        assert_eq!(usage.mcp_tools.len(), 1);
        assert_eq!(usage.mcp_tools[0].server, "github");
        // raw 200k - threshold 167k
        assert_eq!(usage.category(AUTOCOMPACT_BUFFER_LABEL).unwrap().tokens, 33_000);

        let consumed: usize = usage
            .categories
            .iter()
            .filter(|c| c.name != FREE_SPACE_LABEL && c.name != AUTOCOMPACT_BUFFER_LABEL)
            .map(|c| c.tokens)
            .sum();
        assert_eq!(usage.total_tokens, consumed);
        assert_eq!(
            usage.category(FREE_SPACE_LABEL).unwrap().tokens,
            200_000 - consumed - 33_000
        );
    }

    #[tokio::test]
    async fn compact_buffer_when_auto_disabled() {
        let usage = ContextUsage::calculate(
            &budget(false),
            &[Message::user("hi")],
            &ContextSources::default(),
            None,
        )
        .await;
        assert_eq!(usage.category(COMPACT_BUFFER_LABEL).unwrap().tokens, COMPACT_BUFFER);
        assert!(usage.category(AUTOCOMPACT_BUFFER_LABEL).is_none());
    }

    #[tokio::test]
    async fn api_usage_overrides_total() {
        let api = UsageInfo {
            prompt_tokens: Some(50_000),
            ..Default::default()
        };
        let usage = ContextUsage::calculate(
            &budget(true),
            &[Message::user("hi")],
            &ContextSources::default(),
            Some(&api),
        )
        .await;
        assert_eq!(usage.total_tokens, 50_000);
        assert_eq!(usage.percentage, 25);
    }

    #[tokio::test]
    async fn markdown_lists_trailers_last() {
        let usage = ContextUsage::calculate(
            &budget(true),
            &[Message::user("m".repeat(1_600))],
            &ContextSources::default(),
            None,
        )
        .await;
        let md = usage.to_markdown();
        assert!(md.starts_with("## Context Usage\n\n**Model:** test-model"));
        assert!(md.contains("**Tokens:** 1.6k / 200k (1%)"));
        let messages = md.find("| Messages | 1.6k | 0.8% |").unwrap();
        let free = md.find("| Free space |").unwrap();
        let buffer = md.find("| Autocompact buffer | 33k | 16.5% |").unwrap();
        assert!(messages < free && free < buffer);
    }
}
