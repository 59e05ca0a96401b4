//! Bounded retry with exponential backoff for the summarization stream.
//!
//! An attempt that ends without an assistant message is retried after a
//! backoff wait. Waits race the caller's cancellation token, so a cancel
//! aborts a pending wait as quickly as a finished one would return.

use crate::CompactError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// When `false`, exactly one attempt is made.
    pub enabled: bool,
    /// Total attempts including the first (clamped to at least 1).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier (typically 2.0 for exponential backoff).
    pub multiplier: f64,
    /// Whether to shave the delay by a deterministic jitter factor.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Retry disabled: a single attempt.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Enabled with the given total attempt count.
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Number of attempts actually allowed.
    pub fn attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Delay before retrying after the given 1-based failed attempt.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter {
            // Deterministic jitter keyed on the attempt number.
            let jitter_factor = match attempt % 4 {
                0 => 0.85,
                1 => 0.75,
                2 => 0.90,
                _ => 0.60,
            };
            Duration::from_secs_f64(capped * jitter_factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

/// Sleep for `delay` unless `cancel` fires first.
pub async fn sleep_with_cancel(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), CompactError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CompactError::Canceled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Whether an error string indicates a transient (retryable) failure.
pub fn is_transient_error(error: &str) -> bool {
    let transient_statuses = ["408", "429", "500", "502", "503", "504", "529"];
    if transient_statuses
        .iter()
        .any(|s| error.contains(&format!("HTTP {s}")))
    {
        return true;
    }

    let lower = error.to_lowercase();
    [
        "request failed:",
        "connection reset",
        "connection refused",
        "timed out",
        "timeout",
        "broken pipe",
        "network",
        "overloaded",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

/// Whether an error is a permanent (non-retryable) failure.
pub fn is_permanent_error(error: &str) -> bool {
    [
        "HTTP 400",
        "HTTP 401",
        "HTTP 403",
        "HTTP 404",
        "HTTP 413",
        "HTTP 422",
        "bad request",
        "unauthorized",
    ]
    .iter()
    .any(|p| error.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_means_single_attempt() {
        let config = RetryConfig {
            max_attempts: 5,
            ..RetryConfig::disabled()
        };
        assert_eq!(config.attempts(), 1);
    }

    #[test]
    fn zero_attempts_clamps_to_one() {
        assert_eq!(RetryConfig::with_attempts(0).attempts(), 1);
        assert_eq!(RetryConfig::with_attempts(3).attempts(), 3);
    }

    #[test]
    fn delay_increases_exponentially() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::with_attempts(5)
        };
        let d1 = config.delay_after_attempt(1);
        let d2 = config.delay_after_attempt(2);
        let d3 = config.delay_after_attempt(3);

        assert_eq!(d1, Duration::from_millis(500));
        assert!(d2 > d1, "d2={d2:?} should be > d1={d1:?}");
        assert!(d3 > d2, "d3={d3:?} should be > d2={d2:?}");
    }

    #[test]
    fn delay_capped_at_max() {
        let config = RetryConfig {
            jitter: false,
            max_delay: Duration::from_secs(2),
            ..RetryConfig::with_attempts(10)
        };
        assert!(config.delay_after_attempt(10) <= Duration::from_secs(2));
        assert!(config.delay_after_attempt(u32::MAX) <= Duration::from_secs(2));
    }

    #[test]
    fn jitter_reduces_delay() {
        let jittered = RetryConfig::with_attempts(3);
        let plain = RetryConfig {
            jitter: false,
            ..RetryConfig::with_attempts(3)
        };
        for attempt in 1..=4 {
            assert!(jittered.delay_after_attempt(attempt) <= plain.delay_after_attempt(attempt));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_cancel() {
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        sleep_with_cancel(Duration::from_secs(4), &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_pending_sleep() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let start = tokio::time::Instant::now();
        let err = sleep_with_cancel(Duration::from_secs(3600), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_canceled());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn transient_errors_detected() {
        assert!(is_transient_error("OpenRouter API HTTP 429: rate limited"));
        assert!(is_transient_error("OpenRouter API HTTP 502: bad gateway"));
        assert!(is_transient_error("request failed: connection reset"));
        assert!(is_transient_error("failed to read streaming chunk: timed out"));
    }

    #[test]
    fn permanent_errors_detected() {
        assert!(is_permanent_error("OpenRouter API HTTP 400: bad request"));
        assert!(is_permanent_error("OpenRouter API HTTP 401: unauthorized"));
        assert!(!is_transient_error("OpenRouter API HTTP 400: bad request"));
        assert!(!is_transient_error("some random error"));
    }
}
