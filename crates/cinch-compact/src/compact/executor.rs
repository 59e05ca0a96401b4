//! The summarization call: cache-sharing short circuit, then streaming
//! attempts with bounded, cancellable backoff.

use super::progress::{CompactEvent, CompactEventHandler, StreamMode};
use super::prompt::{API_ERROR_PREFIX, build_summarization_prompt};
use crate::api::retry::{RetryConfig, is_transient_error, sleep_with_cancel};
use crate::api::streaming::{AssistantResponse, BlockKind, EventStream, StreamEvent};
use crate::api::{LlmTransport, SummaryRequest};
use crate::context::QuerySource;
use crate::{CompactError, Message, ToolDef, json_schema_for};
use futures::StreamExt;
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Output cap for the summary, independent of the model's own limit.
pub const MAX_COMPACT_OUTPUT_TOKENS: u32 = 20_000;

pub const SUMMARIZER_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant tasked with summarizing conversations.";

// ── Summarizer tools ───────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
#[allow(dead_code)]
struct BashArgs {
    /// The shell command to run.
    command: String,
}

#[derive(Deserialize, JsonSchema)]
#[allow(dead_code)]
struct TextEditorArgs {
    /// One of `view`, `create`, `str_replace`, `insert`.
    command: String,
    /// File to operate on.
    path: String,
    #[serde(default)]
    file_text: Option<String>,
    #[serde(default)]
    old_str: Option<String>,
    #[serde(default)]
    new_str: Option<String>,
}

pub fn bash_tool() -> ToolDef {
    ToolDef::new(
        "bash",
        "Run a shell command.",
        json_schema_for::<BashArgs>(),
    )
}

pub fn text_editor_tool() -> ToolDef {
    ToolDef::new(
        "text_editor",
        "View or edit a file.",
        json_schema_for::<TextEditorArgs>(),
    )
}

/// Keep the first definition of each tool name.
pub fn dedupe_by_name(tools: impl IntoIterator<Item = ToolDef>) -> Vec<ToolDef> {
    let mut seen = HashSet::new();
    tools
        .into_iter()
        .filter(|t| seen.insert(t.name().to_string()))
        .collect()
}

/// Tools offered during summarization: only `bash`, unless the richer set is
/// enabled and the model handles tools.
pub fn summarizer_tools(
    tool_aware: bool,
    model_supports_tools: bool,
    external: &[ToolDef],
) -> Vec<ToolDef> {
    if tool_aware && model_supports_tools {
        dedupe_by_name(
            [bash_tool(), text_editor_tool()]
                .into_iter()
                .chain(external.iter().cloned()),
        )
    } else {
        vec![bash_tool()]
    }
}

/// The single-turn variant sent to the cache-sharing fork: same prefix,
/// no tools.
pub fn fork_request(request: &SummaryRequest) -> SummaryRequest {
    SummaryRequest {
        tools: Vec::new(),
        ..request.clone()
    }
}

/// The conversation followed by the summarization instruction.
pub fn build_summary_request(
    model: &str,
    messages: &[Message],
    custom_instructions: Option<&str>,
    tools: Vec<ToolDef>,
) -> SummaryRequest {
    let mut conversation = messages.to_vec();
    conversation.push(Message::user(build_summarization_prompt(custom_instructions)));
    SummaryRequest {
        model: model.to_string(),
        system_prompt: SUMMARIZER_SYSTEM_PROMPT.to_string(),
        messages: conversation,
        tools,
        max_output_tokens: MAX_COMPACT_OUTPUT_TOKENS,
        query_source: QuerySource::Compact,
    }
}

// ── Executor ───────────────────────────────────────────────────────

pub struct SummaryExecutor<'a> {
    pub transport: &'a dyn LlmTransport,
    pub retry: &'a RetryConfig,
    pub cache_sharing: bool,
    pub events: &'a dyn CompactEventHandler,
}

impl SummaryExecutor<'_> {
    /// Produce an assistant response, or fail with `StreamingFailed` once
    /// every attempt ended without one.
    pub async fn execute(
        &self,
        request: &SummaryRequest,
        cancel: &CancellationToken,
    ) -> Result<AssistantResponse, CompactError> {
        if self.cache_sharing {
            match self
                .transport
                .fork_single_turn(&fork_request(request), cancel)
                .await
            {
                Ok(Some(response)) if response.has_text() => {
                    info!("Summary served by cache-sharing fork");
                    return Ok(response);
                }
                Ok(_) => debug!("Cache-sharing fork returned no text; streaming instead"),
                Err(e) => debug!("Cache-sharing fork failed ({e}); streaming instead"),
            }
            if cancel.is_cancelled() {
                return Err(CompactError::Canceled);
            }
        }

        let attempts = self.retry.attempts();
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(CompactError::Canceled);
            }
            debug!("Summary attempt {attempt}/{attempts}");
            self.events
                .on_event(&CompactEvent::StreamMode(StreamMode::Requesting));

            let response = match self.transport.stream(request, cancel).await {
                Ok(stream) => self.consume(stream, cancel).await?,
                Err(_) if cancel.is_cancelled() => return Err(CompactError::Canceled),
                Err(e) if is_transient_error(&e) => {
                    warn!("Summary stream failed to open: {e}");
                    None
                }
                Err(e) => {
                    return Err(CompactError::Upstream(format!("{API_ERROR_PREFIX}: {e}")));
                }
            };
            if let Some(response) = response {
                return Ok(response);
            }
            if cancel.is_cancelled() {
                return Err(CompactError::Canceled);
            }

            if attempt < attempts {
                let delay = self.retry.delay_after_attempt(attempt);
                self.events
                    .on_event(&CompactEvent::RetryScheduled { attempt, delay });
                sleep_with_cancel(delay, cancel).await?;
            }
        }

        warn!("Summary stream produced no response after {attempts} attempt(s)");
        Err(CompactError::StreamingFailed { attempts })
    }

    /// Drain one stream. `Ok(None)` when it ended without an assistant
    /// message.
    async fn consume(
        &self,
        mut stream: EventStream,
        cancel: &CancellationToken,
    ) -> Result<Option<AssistantResponse>, CompactError> {
        let mut responding = false;
        let mut length = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CompactError::Canceled),
                event = stream.next() => event,
            };
            match next {
                None => return Ok(None),
                Some(StreamEvent::BlockStarted(BlockKind::Text)) if !responding => {
                    responding = true;
                    self.events
                        .on_event(&CompactEvent::StreamMode(StreamMode::Responding));
                }
                Some(StreamEvent::TextDelta(delta)) => {
                    length += delta.chars().count();
                    self.events.on_event(&CompactEvent::ResponseLength(length));
                }
                Some(StreamEvent::Completed(response)) => return Ok(Some(response)),
                Some(StreamEvent::Failed(e)) => {
                    warn!("Summary stream failed: {e}");
                    return Ok(None);
                }
                Some(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compact::progress::FnEventHandler;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Replays one scripted outcome per `stream` call.
    struct Scripted {
        streams: Mutex<VecDeque<Result<Vec<StreamEvent>, String>>>,
        fork: Option<AssistantResponse>,
        forked: Mutex<Vec<SummaryRequest>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(streams: Vec<Result<Vec<StreamEvent>, String>>) -> Self {
            Self {
                streams: Mutex::new(streams.into()),
                fork: None,
                forked: Mutex::new(Vec::new()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl LlmTransport for Scripted {
        async fn stream(
            &self,
            _: &SummaryRequest,
            _: &CancellationToken,
        ) -> Result<EventStream, String> {
            *self.calls.lock().unwrap() += 1;
            let next = self.streams.lock().unwrap().pop_front().unwrap_or(Ok(vec![]));
            next.map(|events| futures::stream::iter(events).boxed())
        }

        async fn fork_single_turn(
            &self,
            request: &SummaryRequest,
            _: &CancellationToken,
        ) -> Result<Option<AssistantResponse>, String> {
            self.forked.lock().unwrap().push(request.clone());
            Ok(self.fork.clone())
        }
    }

    fn text_stream(text: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::Started,
            StreamEvent::BlockStarted(BlockKind::Text),
            StreamEvent::TextDelta(text.to_string()),
            StreamEvent::Completed(AssistantResponse::new(text)),
        ]
    }

    fn request() -> SummaryRequest {
        build_summary_request("m", &[Message::user("hi")], None, vec![bash_tool()])
    }

    fn recorder() -> (Arc<Mutex<Vec<CompactEvent>>>, FnEventHandler<impl Fn(&CompactEvent) + Send + Sync>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, FnEventHandler::new(move |e: &CompactEvent| sink.lock().unwrap().push(e.clone())))
    }

    #[test]
    fn tool_selection() {
        let names = |tools: Vec<ToolDef>| tools.iter().map(|t| t.name().to_string()).collect::<Vec<_>>();
        let external = vec![
            ToolDef::new("bash", "dup", serde_json::json!({})),
            ToolDef::new("grep", "search", serde_json::json!({})),
        ];
        assert_eq!(names(summarizer_tools(false, true, &external)), vec!["bash"]);
        assert_eq!(names(summarizer_tools(true, false, &external)), vec!["bash"]);
        assert_eq!(
            names(summarizer_tools(true, true, &external)),
            vec!["bash", "text_editor", "grep"]
        );
        let tools = summarizer_tools(true, true, &external);
        assert_eq!(tools[0].function.description, "Run a shell command.");
    }

    #[test]
    fn request_caps_output_and_appends_instruction() {
        let req = build_summary_request("m", &[Message::user("hi")], Some("keep APIs"), vec![]);
        assert_eq!(req.max_output_tokens, MAX_COMPACT_OUTPUT_TOKENS);
        assert_eq!(req.messages.len(), 2);
        assert!(req.messages[1].text().contains("Additional Instructions:\nkeep APIs"));
        assert_eq!(req.query_source, QuerySource::Compact);
    }

    #[tokio::test]
    async fn streams_and_reports_progress() {
        let transport = Scripted::new(vec![Ok(text_stream("Summary: ok"))]);
        let (seen, handler) = recorder();
        let exec = SummaryExecutor {
            transport: &transport,
            retry: &RetryConfig::default(),
            cache_sharing: false,
            events: &handler,
        };
        let response = exec.execute(&request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(response.text, "Summary: ok");

        let events = seen.lock().unwrap();
        assert!(events.contains(&CompactEvent::StreamMode(StreamMode::Responding)));
        assert!(events.contains(&CompactEvent::ResponseLength(11)));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_a_message_arrives() {
        let transport = Scripted::new(vec![
            Ok(vec![StreamEvent::Started]),
            Err("OpenRouter API HTTP 503 Service Unavailable: busy".into()),
            Ok(text_stream("third time")),
        ]);
        let (seen, handler) = recorder();
        let exec = SummaryExecutor {
            transport: &transport,
            retry: &RetryConfig::with_attempts(3),
            cache_sharing: false,
            events: &handler,
        };
        let response = exec.execute(&request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(response.text, "third time");
        assert_eq!(transport.calls(), 3);
        let retries: Vec<u32> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                CompactEvent::RetryScheduled { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn retry_disabled_means_one_attempt() {
        let transport = Scripted::new(vec![Ok(vec![]), Ok(text_stream("never reached"))]);
        let exec = SummaryExecutor {
            transport: &transport,
            retry: &RetryConfig::disabled(),
            cache_sharing: false,
            events: &crate::compact::progress::NoopHandler,
        };
        let err = exec.execute(&request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CompactError::StreamingFailed { attempts: 1 }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn permanent_open_error_is_upstream() {
        let transport = Scripted::new(vec![Err("OpenRouter API HTTP 401 Unauthorized: bad key".into())]);
        let exec = SummaryExecutor {
            transport: &transport,
            retry: &RetryConfig::default(),
            cache_sharing: false,
            events: &crate::compact::progress::NoopHandler,
        };
        let err = exec.execute(&request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CompactError::Upstream(ref t) if t.starts_with("API Error: ")));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn cache_sharing_short_circuits() {
        let mut transport = Scripted::new(vec![Ok(text_stream("streamed"))]);
        transport.fork = Some(AssistantResponse::new("from cache"));
        let exec = SummaryExecutor {
            transport: &transport,
            retry: &RetryConfig::default(),
            cache_sharing: true,
            events: &crate::compact::progress::NoopHandler,
        };
        let response = exec.execute(&request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(response.text, "from cache");
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn cache_fork_denies_tools() {
        let mut transport = Scripted::new(vec![]);
        transport.fork = Some(AssistantResponse::new("from cache"));
        let exec = SummaryExecutor {
            transport: &transport,
            retry: &RetryConfig::default(),
            cache_sharing: true,
            events: &crate::compact::progress::NoopHandler,
        };
        let full = build_summary_request(
            "m",
            &[Message::user("hi")],
            None,
            summarizer_tools(true, true, &[]),
        );
        exec.execute(&full, &CancellationToken::new()).await.unwrap();

        let forked = transport.forked.lock().unwrap();
        assert_eq!(forked.len(), 1);
        assert!(forked[0].tools.is_empty());
        assert_eq!(forked[0].messages, full.messages);
        assert_eq!(forked[0].max_output_tokens, MAX_COMPACT_OUTPUT_TOKENS);
    }

    #[tokio::test]
    async fn unrecognized_open_error_is_not_retried() {
        let transport = Scripted::new(vec![
            Err("OpenRouter API HTTP 418 I'm a teapot: no".into()),
            Ok(text_stream("never reached")),
        ]);
        let exec = SummaryExecutor {
            transport: &transport,
            retry: &RetryConfig::default(),
            cache_sharing: false,
            events: &crate::compact::progress::NoopHandler,
        };
        let err = exec.execute(&request(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CompactError::Upstream(ref t) if t.contains("HTTP 418")));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn empty_cache_response_falls_through() {
        let mut transport = Scripted::new(vec![Ok(text_stream("streamed"))]);
        transport.fork = Some(AssistantResponse::new("   "));
        let exec = SummaryExecutor {
            transport: &transport,
            retry: &RetryConfig::default(),
            cache_sharing: true,
            events: &crate::compact::progress::NoopHandler,
        };
        let response = exec.execute(&request(), &CancellationToken::new()).await.unwrap();
        assert_eq!(response.text, "streamed");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_is_immediate() {
        let transport = Scripted::new(vec![Ok(vec![]), Ok(vec![])]);
        let retry = RetryConfig {
            initial_delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(3600),
            ..RetryConfig::with_attempts(2)
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });

        let exec = SummaryExecutor {
            transport: &transport,
            retry: &retry,
            cache_sharing: false,
            events: &crate::compact::progress::NoopHandler,
        };
        let start = tokio::time::Instant::now();
        let err = exec.execute(&request(), &cancel).await.unwrap_err();
        assert!(err.is_canceled());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(transport.calls(), 1);
    }
}
