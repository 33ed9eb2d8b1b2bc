//! Retry utilities with exponential backoff
//!
//! Transient failures retry on an exponential schedule; throttling responses
//! retry on a separate, slower schedule that honors a server-provided delay
//! when one is available.

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

const LOG_TARGET: &str = "tts::retry";

/// Configuration for retry behavior
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Initial delay after a throttling response without a server hint
    pub rate_limit_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Upper bound of the random fraction added to each delay
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            rate_limit_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Surface the error immediately.
    Stop,
    /// Retry on the standard exponential schedule.
    Backoff,
    /// Retry on the throttling schedule, or after the server's hint.
    Throttled(Option<Duration>),
}

impl RetryConfig {
    /// Create a new retry configuration with custom values
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Default::default()
        }
    }

    /// Configuration that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn scaled(&self, base: Duration, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_ms = base.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let delay = Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64);
        delay.min(self.max_delay)
    }

    /// Calculate the delay for a given attempt number
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.scaled(self.initial_delay, attempt)
    }

    fn delay_for(&self, decision: RetryDecision, attempt: u32) -> Option<Duration> {
        match decision {
            RetryDecision::Stop => None,
            RetryDecision::Backoff => Some(self.delay_for_attempt(attempt)),
            RetryDecision::Throttled(Some(hint)) => Some(hint.min(self.max_delay)),
            RetryDecision::Throttled(None) => Some(self.scaled(self.rate_limit_delay, attempt)),
        }
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + rand::rng().random_range(0.0..=self.jitter);
        delay.mul_f64(factor).min(self.max_delay)
    }
}

/// Retry a function with exponential backoff.
///
/// `classify` decides per error whether and how to retry. The closure
/// receives the 1-based attempt number.
pub async fn retry_with_backoff<F, T, E, Fut>(
    config: &RetryConfig,
    mut f: F,
    classify: impl Fn(&E) -> RetryDecision,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match f(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(target: LOG_TARGET, attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(e);
                }
                let Some(delay) = config.delay_for(classify(&e), attempt) else {
                    return Err(e);
                };
                let delay = config.with_jitter(delay);
                warn!(
                    target: LOG_TARGET,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Check if an HTTP status is worth another attempt
pub fn is_http_retryable(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}
