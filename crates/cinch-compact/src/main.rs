//! Inspect and compact JSONL agent transcripts.
//!
//! The session id is the transcript's file stem. Settings come from
//! `<data-dir>/settings.json`, hooks from `<data-dir>/hooks.json`, and the
//! API key from the `OPENROUTER_KEY` environment variable.
//!
//! # Examples
//!
//! ```sh
//! # Token budget status
//! cinch-compact status sessions/s1.jsonl
//!
//! # Window usage breakdown with the system prompt included
//! cinch-compact context sessions/s1.jsonl --system-prompt prompt.md
//!
//! # Evict old tool output down to 40k tokens, in place
//! cinch-compact micro sessions/s1.jsonl --target 40000 --write
//!
//! # Summarize with extra guidance
//! cinch-compact compact sessions/s1.jsonl --instructions "keep the API decisions"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cinch_compact::compact::progress::LoggingHandler;
use cinch_compact::context::{ToolResultStore, micro_compact};
use cinch_compact::hooks::ExternalHookRunner;
use cinch_compact::persist::write_atomic;
use cinch_compact::prelude::*;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Context budget and compaction for agent transcripts.
#[derive(Parser)]
#[command(name = "cinch-compact")]
struct Cli {
    /// Model whose window the transcript is measured against.
    #[arg(long, global = true, default_value = "anthropic/claude-sonnet-4")]
    model: String,

    /// Directory for settings, hooks, evicted output and session memory.
    #[arg(long, global = true, default_value = ".cinch")]
    data_dir: PathBuf,

    /// Working directory for file restoration and hooks.
    #[arg(long, global = true, default_value = ".")]
    workdir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the token budget status.
    Status { transcript: PathBuf },
    /// Print a per-category breakdown of window usage.
    Context {
        transcript: PathBuf,
        /// File holding the system prompt.
        #[arg(long)]
        system_prompt: Option<PathBuf>,
        /// Memory/instruction files loaded into the system message.
        #[arg(long = "memory-file")]
        memory_files: Vec<PathBuf>,
    },
    /// Evict old tool results without an LLM call.
    Micro {
        transcript: PathBuf,
        /// Token target. Without it, eviction only runs above the warning
        /// threshold.
        #[arg(long)]
        target: Option<usize>,
        /// Rewrite the transcript in place instead of printing it.
        #[arg(long)]
        write: bool,
    },
    /// Compact the transcript and rewrite it in place.
    Compact {
        transcript: PathBuf,
        /// Extra guidance for the summary.
        #[arg(long)]
        instructions: Option<String>,
        /// Run as the automatic trigger (only compacts when due).
        #[arg(long)]
        auto: bool,
    },
}

fn session_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "session".to_string())
}

async fn load_transcript(path: &Path) -> Result<Transcript, String> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    Transcript::from_jsonl(session_id(path), &raw).map_err(|e| e.to_string())
}

async fn save_transcript(path: &Path, transcript: &Transcript) -> Result<(), String> {
    let jsonl = transcript.to_jsonl().map_err(|e| e.to_string())?;
    write_atomic(path, jsonl.as_bytes())
        .await
        .map_err(|e| format!("failed to write {}: {e}", path.display()))
}

async fn run(cli: Cli) -> Result<(), String> {
    let settings = CompactSettings::load(cli.data_dir.join("settings.json"));
    let config = CompactionConfig::from_env_and_settings(&settings).with_data_dir(&cli.data_dir);
    let budget = ContextBudget::new(&cli.model, &config);

    match cli.command {
        Command::Status { transcript } => {
            let transcript = load_transcript(&transcript).await?;
            let status = budget.status(transcript.messages());
            println!("{}", status.to_log_string());
            println!(
                "effective window {}, auto-compact at {}, blocking at {}",
                budget.effective_context_window(),
                budget.auto_compact_threshold(),
                budget.blocking_limit()
            );
        }
        Command::Context {
            transcript,
            system_prompt,
            memory_files,
        } => {
            let transcript = load_transcript(&transcript).await?;
            let system_prompt = match system_prompt {
                Some(path) => tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| format!("failed to read {}: {e}", path.display()))?,
                None => String::new(),
            };
            let sources = ContextSources {
                system_prompt,
                tools: Vec::new(),
                memory_files,
            };
            let usage =
                ContextUsage::calculate(&budget, transcript.messages(), &sources, None).await;
            println!("{}", usage.to_markdown());
        }
        Command::Micro {
            transcript: path,
            target,
            write,
        } => {
            let mut transcript = load_transcript(&path).await?;
            let store = ToolResultStore::new(&config.data_dir, transcript.session_id());
            let micro = micro_compact(
                transcript.messages(),
                target,
                &budget,
                &config.micro_compact,
                &store,
            )
            .await
            .map_err(|e| e.to_string())?;
            info!(
                "Evicted {} tool result(s), ~{} tokens freed",
                micro.evicted.len(),
                micro.tokens_freed
            );
            transcript.replace(micro.messages);
            if write {
                save_transcript(&path, &transcript).await?;
            } else {
                print!("{}", transcript.to_jsonl().map_err(|e| e.to_string())?);
            }
        }
        Command::Compact {
            transcript: path,
            instructions,
            auto,
        } => {
            let mut transcript = load_transcript(&path).await?;
            let transport = OpenRouterTransport::from_env()?;
            let hooks = ExternalHookRunner::load(cli.data_dir.join("hooks.json"), &cli.workdir);
            let transcript_dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let compactor = Compactor::new(config, budget, Arc::new(transport))
                .with_hooks(Arc::new(hooks))
                .with_event_handler(Arc::new(LoggingHandler))
                .with_workdir(&cli.workdir)
                .with_transcript_dir(transcript_dir);
            compactor
                .read_file_state()
                .record_from_transcript(transcript.messages());

            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, canceling compaction");
                    on_ctrl_c.cancel();
                }
            });

            let result = if auto {
                compactor
                    .auto_compact_if_needed(&mut transcript, QuerySource::MainThread, &cancel)
                    .await
            } else {
                compactor
                    .compact(&mut transcript, CompactRequest::manual(instructions), &cancel)
                    .await
                    .map(Some)
            };
            let outcome = result.map_err(|e| e.to_string())?;

            match outcome {
                Some(outcome) => {
                    save_transcript(&path, &transcript).await?;
                    println!("{}", outcome.display_text);
                }
                None => println!("{}", compactor.budget().status(transcript.messages()).to_log_string()),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
