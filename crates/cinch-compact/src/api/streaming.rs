//! Server-Sent Events (SSE) decoding for streamed chat completions.
//!
//! [`SseDecoder`] turns raw response bytes into typed [`StreamEvent`]s as
//! they arrive. The compaction executor consumes these through an
//! [`EventStream`]: block starts flip the progress mode, text deltas grow the
//! observed response length, and a final [`StreamEvent::Completed`] carries
//! the assembled assistant message. A stream that ends without `Completed`
//! produced no assistant message.

use crate::UsageInfo;
use futures::stream::BoxStream;
use serde::Deserialize;
use tracing::{trace, warn};

/// Kind of content block the model started emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    ToolUse,
    Thinking,
}

/// A single event from a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The first chunk arrived.
    Started,
    /// The model switched to a new content block.
    BlockStarted(BlockKind),
    /// An incremental text content delta.
    TextDelta(String),
    /// Token usage information (sent in the final chunk).
    Usage(UsageInfo),
    /// The assembled assistant message. Only emitted when it has text.
    Completed(AssistantResponse),
    /// The provider reported an error mid-stream.
    Failed(String),
}

/// The assistant message assembled from a stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantResponse {
    pub text: String,
    pub usage: Option<UsageInfo>,
}

impl AssistantResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }

    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// A cancellable stream of events for one request.
pub type EventStream = BoxStream<'static, StreamEvent>;

// ── Wire chunks ────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<UsageInfo>,
    error: Option<StreamError>,
}

#[derive(Deserialize, Debug)]
struct StreamError {
    message: String,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
    reasoning: Option<String>,
    tool_calls: Option<Vec<serde_json::Value>>,
}

// ── Decoder ────────────────────────────────────────────────────────

/// Incremental SSE decoder.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    text: String,
    usage: Option<UsageInfo>,
    block: Option<BlockKind>,
    started: bool,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `[DONE]` (or an error) has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a chunk of bytes; returns the events it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.decode_line(line.trim(), &mut events);
            if self.done {
                break;
            }
        }
        events
    }

    /// End of input: flush a trailing partial line and emit the completed
    /// message if the stream never sent `[DONE]`.
    pub fn finish(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.done {
            let rest = std::mem::take(&mut self.buffer);
            let rest = String::from_utf8_lossy(&rest);
            self.decode_line(rest.trim(), &mut events);
        }
        if !self.done {
            self.complete(&mut events);
        }
        events
    }

    fn complete(&mut self, events: &mut Vec<StreamEvent>) {
        self.done = true;
        let response = AssistantResponse {
            text: std::mem::take(&mut self.text),
            usage: self.usage.take(),
        };
        if response.has_text() {
            events.push(StreamEvent::Completed(response));
        } else {
            trace!("stream ended without assistant text");
        }
    }

    fn decode_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
            return;
        };
        if data == "[DONE]" {
            self.complete(events);
            return;
        }

        let chunk = match serde_json::from_str::<StreamChunk>(data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to parse SSE chunk: {e}");
                return;
            }
        };
        if !self.started {
            self.started = true;
            events.push(StreamEvent::Started);
        }
        if let Some(err) = chunk.error {
            self.done = true;
            events.push(StreamEvent::Failed(err.message));
            return;
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.clone());
            events.push(StreamEvent::Usage(usage));
        }

        for choice in chunk.choices.unwrap_or_default() {
            if let Some(delta) = choice.delta {
                if let Some(reasoning) = delta.reasoning
                    && !reasoning.is_empty()
                {
                    self.enter_block(BlockKind::Thinking, events);
                }
                if let Some(content) = delta.content
                    && !content.is_empty()
                {
                    self.enter_block(BlockKind::Text, events);
                    self.text.push_str(&content);
                    events.push(StreamEvent::TextDelta(content));
                }
                if delta.tool_calls.is_some_and(|calls| !calls.is_empty()) {
                    self.enter_block(BlockKind::ToolUse, events);
                }
            }
            if choice.finish_reason.is_some() {
                trace!("Stream finish_reason: {:?}", choice.finish_reason);
            }
        }
    }

    fn enter_block(&mut self, kind: BlockKind, events: &mut Vec<StreamEvent>) {
        if self.block != Some(kind) {
            self.block = Some(kind);
            events.push(StreamEvent::BlockStarted(kind));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Concatenated text deltas.
    fn collect_text(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta(delta) => Some(delta.as_str()),
                _ => None,
            })
            .collect()
    }

    fn data(json: &str) -> String {
        format!("data: {json}\n\n")
    }

    #[test]
    fn decodes_text_and_completes_on_done() {
        let mut decoder = SseDecoder::new();
        let mut events = decoder.push(data(r#"{"choices":[{"delta":{"content":"Sum"}}]}"#).as_bytes());
        events.extend(decoder.push(data(r#"{"choices":[{"delta":{"content":"mary"}}]}"#).as_bytes()));
        events.extend(decoder.push(
            data(r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":2,"total_tokens":12}}"#).as_bytes(),
        ));
        events.extend(decoder.push(b"data: [DONE]\n"));
        assert!(decoder.is_done());

        assert_eq!(events[0], StreamEvent::Started);
        assert_eq!(events[1], StreamEvent::BlockStarted(BlockKind::Text));
        assert_eq!(collect_text(&events), "Summary");
        let Some(StreamEvent::Completed(response)) = events.last() else {
            panic!("expected Completed, got {events:?}");
        };
        assert_eq!(response.text, "Summary");
        assert_eq!(response.usage.as_ref().and_then(|u| u.total_tokens), Some(12));
        // Only one block start for consecutive text deltas.
        let starts = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::BlockStarted(_)))
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn empty_stream_has_no_completion() {
        let mut decoder = SseDecoder::new();
        let mut events = decoder.push(data(r#"{"choices":[{"delta":{"content":""},"finish_reason":"stop"}]}"#).as_bytes());
        events.extend(decoder.push(b"data: [DONE]\n"));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Completed(_))));
    }

    #[test]
    fn split_utf8_and_missing_done() {
        let line = data(r#"{"choices":[{"delta":{"content":"héllo"}}]}"#);
        let bytes = line.as_bytes();
        let split = line.find('é').unwrap() + 1; // inside the two-byte char
        let mut decoder = SseDecoder::new();
        let mut events = decoder.push(&bytes[..split]);
        assert!(events.is_empty());
        events.extend(decoder.push(&bytes[split..]));
        events.extend(decoder.finish());
        assert_eq!(collect_text(&events), "héllo");
        assert!(matches!(events.last(), Some(StreamEvent::Completed(r)) if r.text == "héllo"));
    }

    #[test]
    fn block_transitions_and_errors() {
        let mut decoder = SseDecoder::new();
        let mut events = decoder.push(data(r#"{"choices":[{"delta":{"reasoning":"hmm"}}]}"#).as_bytes());
        events.extend(decoder.push(
            data(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1"}]}}]}"#).as_bytes(),
        ));
        events.extend(decoder.push(data(r#"{"error":{"message":"overloaded"}}"#).as_bytes()));
        assert_eq!(
            events,
            vec![
                StreamEvent::Started,
                StreamEvent::BlockStarted(BlockKind::Thinking),
                StreamEvent::BlockStarted(BlockKind::ToolUse),
                StreamEvent::Failed("overloaded".into()),
            ]
        );
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn comments_and_garbage_are_skipped() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keep-alive\n\ndata: {not json}\nevent: ping\n");
        assert!(events.is_empty());
    }
}
