//! Progress events emitted while a compaction runs.
//!
//! Callers implement [`CompactEventHandler`] to drive a spinner, a status
//! line, or logs. The orchestrator installs a [`ProgressReset`] guard at the
//! start of every compaction; when it drops (success, error, or
//! cancellation) the indicators are reset and [`CompactEvent::CompactEnd`]
//! is emitted.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or headless runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |

use crate::CompactTrigger;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Which hook phase is starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    PreCompact,
    SessionStart,
}

/// Streaming status of the summarization call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Waiting for the first content.
    Requesting,
    /// Text is arriving.
    Responding,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompactEvent {
    Started {
        trigger: CompactTrigger,
        pre_tokens: usize,
    },
    HooksStarted(HookPhase),
    StreamMode(StreamMode),
    /// Observed response length in characters. For display only.
    ResponseLength(usize),
    RetryScheduled {
        /// The attempt that just failed, 1-based.
        attempt: u32,
        delay: Duration,
    },
    /// Always the last event of a compaction.
    CompactEnd,
}

/// Observer for compaction progress.
pub trait CompactEventHandler: Send + Sync {
    fn on_event(&self, _event: &CompactEvent) {}
}

/// Ignores every event.
pub struct NoopHandler;
impl CompactEventHandler for NoopHandler {}

/// Logs events through `tracing`.
pub struct LoggingHandler;

impl CompactEventHandler for LoggingHandler {
    fn on_event(&self, event: &CompactEvent) {
        match event {
            CompactEvent::Started {
                trigger,
                pre_tokens,
            } => info!("Compacting ({trigger}, ~{pre_tokens} tokens)"),
            CompactEvent::HooksStarted(phase) => debug!("Running {phase:?} hooks"),
            CompactEvent::StreamMode(mode) => debug!("Stream mode: {mode:?}"),
            CompactEvent::ResponseLength(_) => {}
            CompactEvent::RetryScheduled { attempt, delay } => info!(
                "Summary attempt {attempt} produced no response, retrying in {:.1}s",
                delay.as_secs_f64()
            ),
            CompactEvent::CompactEnd => debug!("Compaction finished"),
        }
    }
}

/// An event handler backed by a closure.
pub struct FnEventHandler<F>(F)
where
    F: Fn(&CompactEvent) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&CompactEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> CompactEventHandler for FnEventHandler<F>
where
    F: Fn(&CompactEvent) + Send + Sync,
{
    fn on_event(&self, event: &CompactEvent) {
        (self.0)(event)
    }
}

/// Resets the progress indicators when dropped.
pub struct ProgressReset {
    handler: Arc<dyn CompactEventHandler>,
}

impl ProgressReset {
    pub fn new(handler: Arc<dyn CompactEventHandler>) -> Self {
        Self { handler }
    }
}

impl Drop for ProgressReset {
    fn drop(&mut self) {
        self.handler
            .on_event(&CompactEvent::StreamMode(StreamMode::Requesting));
        self.handler.on_event(&CompactEvent::ResponseLength(0));
        self.handler.on_event(&CompactEvent::CompactEnd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn reset_runs_on_every_exit() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Arc<dyn CompactEventHandler> =
            Arc::new(FnEventHandler::new(move |e| sink.lock().unwrap().push(e.clone())));

        let run = |fail: bool| -> Result<(), ()> {
            let _reset = ProgressReset::new(handler.clone());
            handler.on_event(&CompactEvent::StreamMode(StreamMode::Responding));
            if fail { Err(()) } else { Ok(()) }
        };
        run(true).unwrap_err();
        run(false).unwrap();

        let events = seen.lock().unwrap();
        let ends = events
            .iter()
            .filter(|e| matches!(e, CompactEvent::CompactEnd))
            .count();
        assert_eq!(ends, 2);
        assert_eq!(
            events[1..4],
            [
                CompactEvent::StreamMode(StreamMode::Requesting),
                CompactEvent::ResponseLength(0),
                CompactEvent::CompactEnd,
            ]
        );
    }
}
