//! Reference [`LlmTransport`] over the OpenRouter chat completions API.
//!
//! Transcript messages are flattened into the OpenAI wire format (tool uses
//! become `tool_calls`, tool results become `tool` role messages). Errors
//! the summary can't recover from are folded into the response text with a
//! recognizable prefix so the orchestrator's validation step reports them:
//!
//! - context-length failures → `Prompt is too long: …`
//! - other permanent HTTP errors (400/401/403/…) → `API Error: …`
//!
//! Transient failures (429, 5xx, network) are returned as `Err` and count
//! as an attempt without an assistant message.
//!
//! The cache-sharing fork is a plain non-streaming completion with no tools
//! attached. Any failure there is returned as `Err` so the caller can fall
//! back to streaming.

use super::retry::is_permanent_error;
use super::streaming::{AssistantResponse, EventStream, SseDecoder, StreamEvent};
use super::{LlmTransport, SummaryRequest};
use crate::compact::prompt::{API_ERROR_PREFIX, PROMPT_TOO_LONG_PREFIX};
use crate::{ContentBlock, Message, MessageRole, ToolDef, UsageInfo};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Environment variable holding the API key.
pub const OPENROUTER_KEY_ENV: &str = "OPENROUTER_KEY";

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDef]>,
    stream: bool,
    usage: UsageRequest,
}

#[derive(Serialize, Debug)]
struct UsageRequest {
    include: bool,
}

#[derive(Serialize, Debug, PartialEq)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Debug, PartialEq)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: WireFunctionCall,
}

#[derive(Serialize, Debug, PartialEq)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

/// Non-streaming completion body.
#[derive(Deserialize, Debug)]
struct Completion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize, Debug)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

impl WireMessage {
    fn text(role: &'static str, content: String) -> Self {
        Self {
            role,
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Flatten one transcript message into wire messages.
fn to_wire(message: &Message) -> Vec<WireMessage> {
    let text = message.text();
    match message.role {
        MessageRole::System => vec![WireMessage::text("system", text)],
        MessageRole::Assistant => {
            let calls: Vec<WireToolCall> = message
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => Some(WireToolCall {
                        id: id.clone(),
                        call_type: "function",
                        function: WireFunctionCall {
                            name: name.clone(),
                            arguments: input.to_string(),
                        },
                    }),
                    _ => None,
                })
                .collect();
            vec![WireMessage {
                role: "assistant",
                content: (!text.is_empty()).then_some(text),
                tool_calls: (!calls.is_empty()).then_some(calls),
                tool_call_id: None,
            }]
        }
        MessageRole::User => {
            let mut out: Vec<WireMessage> = message
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => Some(WireMessage {
                        role: "tool",
                        content: Some(content.clone()),
                        tool_calls: None,
                        tool_call_id: Some(tool_use_id.clone()),
                    }),
                    _ => None,
                })
                .collect();
            if !text.is_empty() {
                out.push(WireMessage::text("user", text));
            }
            out
        }
    }
}

/// Whether an HTTP error body describes an over-long prompt.
pub fn is_context_length_error(body: &str) -> bool {
    let lower = body.to_lowercase();
    [
        "context_length_exceeded",
        "context length",
        "maximum context",
        "prompt is too long",
        "too many tokens",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

/// Map a failed HTTP status to either a terminal response text (`Ok`) or a
/// retryable error (`Err`).
fn classify_http_failure(status: &str, body: &str) -> Result<String, String> {
    let error = format!("OpenRouter API HTTP {status}: {body}");
    if is_context_length_error(body) {
        warn!("Summary request exceeded the context window");
        return Ok(format!("{PROMPT_TOO_LONG_PREFIX}: {error}"));
    }
    if is_permanent_error(&error) {
        return Ok(format!("{API_ERROR_PREFIX}: {error}"));
    }
    Err(error)
}

/// Text and usage from a non-streaming completion body.
fn parse_completion(body: &str) -> Result<AssistantResponse, String> {
    let completion: Completion =
        serde_json::from_str(body).map_err(|e| format!("malformed completion: {e}"))?;
    let text = completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    Ok(AssistantResponse {
        text,
        usage: completion.usage,
    })
}

fn chat_request(request: &SummaryRequest, stream: bool) -> ChatRequest<'_> {
    ChatRequest {
        model: &request.model,
        messages: std::iter::once(WireMessage::text("system", request.system_prompt.clone()))
            .chain(request.messages.iter().flat_map(to_wire))
            .collect(),
        max_tokens: request.max_output_tokens,
        tools: (stream && !request.tools.is_empty()).then_some(request.tools.as_slice()),
        stream,
        usage: UsageRequest { include: true },
    }
}

/// Read the whole body unless `cancel` fires first.
async fn read_body(resp: reqwest::Response, cancel: &CancellationToken) -> Result<String, String> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err("request canceled".into()),
        text = resp.text() => text.map_err(|e| format!("failed to read response body: {e}")),
    }
}

// ── Transport ──────────────────────────────────────────────────────

/// Streaming OpenRouter client.
pub struct OpenRouterTransport {
    client: reqwest::Client,
    api_key: String,
    referer: String,
    title: String,
}

impl OpenRouterTransport {
    /// Create a new transport with the given API key and default headers.
    pub fn new(api_key: impl Into<String>) -> Result<Self, String> {
        Self::with_headers(api_key, "https://github.com/cinch-rs", "cinch-compact")
    }

    /// Create a new transport with custom Referer and X-Title headers.
    pub fn with_headers(
        api_key: impl Into<String>,
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent("cinch-compact/0.1")
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            referer: referer.into(),
            title: title.into(),
        })
    }

    /// Read the key from `OPENROUTER_KEY`.
    pub fn from_env() -> Result<Self, String> {
        let key = std::env::var(OPENROUTER_KEY_ENV)
            .map_err(|_| format!("{OPENROUTER_KEY_ENV} is not set"))?;
        Self::new(key)
    }

    async fn post(
        &self,
        body: &ChatRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, String> {
        debug!(
            "Summary request: model={}, messages={}, tools={}, max_tokens={}, stream={}",
            body.model,
            body.messages.len(),
            body.tools.map_or(0, <[ToolDef]>::len),
            body.max_tokens,
            body.stream
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();
        let send = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(body)
            .send();
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err("request canceled".into()),
            r = send => r.map_err(|e| format!("request failed: {e}"))?,
        };
        debug!(
            "Summary response: HTTP {} in {:.1}s",
            resp.status(),
            start.elapsed().as_secs_f64()
        );
        Ok(resp)
    }
}

/// A stream that yields exactly one completed response.
fn single_response(text: String) -> EventStream {
    futures::stream::iter([
        StreamEvent::Started,
        StreamEvent::Completed(AssistantResponse::new(text)),
    ])
    .boxed()
}

struct BodyState {
    response: reqwest::Response,
    decoder: Option<SseDecoder>,
    pending: VecDeque<StreamEvent>,
    cancel: CancellationToken,
}

/// Turn a streaming response body into events, ending early on cancel.
fn body_stream(response: reqwest::Response, cancel: CancellationToken) -> EventStream {
    let state = BodyState {
        response,
        decoder: Some(SseDecoder::new()),
        pending: VecDeque::new(),
        cancel,
    };
    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((event, st));
            }
            let done = st.decoder.as_ref()?.is_done();
            if done {
                st.decoder = None;
                continue;
            }

            let next = tokio::select! {
                biased;
                _ = st.cancel.cancelled() => None,
                chunk = st.response.chunk() => Some(chunk),
            };
            let Some(chunk) = next else {
                debug!("stream canceled");
                return None;
            };
            match chunk {
                Ok(Some(bytes)) => {
                    if let Some(decoder) = st.decoder.as_mut() {
                        let events = decoder.push(&bytes);
                        st.pending.extend(events);
                    }
                }
                Ok(None) => {
                    if let Some(decoder) = st.decoder.take() {
                        st.pending.extend(decoder.finish());
                    }
                }
                Err(e) => {
                    st.decoder = None;
                    st.pending
                        .push_back(StreamEvent::Failed(format!("failed to read streaming chunk: {e}")));
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl LlmTransport for OpenRouterTransport {
    async fn stream(
        &self,
        request: &SummaryRequest,
        cancel: &CancellationToken,
    ) -> Result<EventStream, String> {
        let resp = self.post(&chat_request(request, true), cancel).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = read_body(resp, cancel).await.unwrap_or_default();
            return classify_http_failure(&status.to_string(), &body).map(single_response);
        }
        Ok(body_stream(resp, cancel.clone()))
    }

    async fn fork_single_turn(
        &self,
        request: &SummaryRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<AssistantResponse>, String> {
        let resp = self.post(&chat_request(request, false), cancel).await?;
        let status = resp.status();
        let body = read_body(resp, cancel).await?;
        if !status.is_success() {
            return Err(format!("OpenRouter API HTTP {status}: {body}"));
        }
        parse_completion(&body).map(Some)
    }
}
