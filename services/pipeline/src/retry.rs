//! Failure policy and capped exponential backoff.
//!
//! Shared by the ingest publish path, the ingest reconnect loop and the
//! storage inference call. Every sleep races the cancellation token.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Capped exponential backoff parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Randomization factor in [0, 1]; 0 disables jitter
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffConfig {
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            ..Default::default()
        }
    }

    /// Build an unbounded exponential backoff; callers cap attempts themselves
    pub fn build(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.initial_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms));
        let mut backoff = ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            randomization_factor: self.jitter.clamp(0.0, 1.0),
            multiplier: self.multiplier.max(1.0),
            max_interval: max,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

/// What to do with a batch whose delivery keeps failing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log, back off once, discard
    #[default]
    Drop,
    /// Retry with backoff up to `max_attempts`, then discard
    Retry,
    /// Retry with backoff up to `max_attempts`, then hand to the dead-letter topic
    DeadLetter,
}

/// Failure policy plus its retry budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureHandling {
    #[serde(default)]
    pub policy: FailurePolicy,
    /// Total attempts including the first; only used by `retry` and `dead_letter`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for FailureHandling {
    fn default() -> Self {
        Self {
            policy: FailurePolicy::default(),
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl FailureHandling {
    /// Attempts to make before giving up on a batch
    pub fn attempts(&self) -> u32 {
        match self.policy {
            FailurePolicy::Drop => 1,
            FailurePolicy::Retry | FailurePolicy::DeadLetter => self.max_attempts.max(1),
        }
    }
}

/// Sleep for `duration` unless cancelled first. Returns `false` when cancelled.
pub async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Run `op` up to `attempts` times, backing off between failures.
///
/// Returns the first success or the last error. Stops early (returning the
/// last error) when `cancel` fires during a backoff sleep.
pub async fn retry_with_backoff<T, E, F, Fut>(
    attempts: u32,
    backoff: &BackoffConfig,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut delays = backoff.build();
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts || cancel.is_cancelled() => return Err(e),
            Err(e) => {
                let delay = delays
                    .next_backoff()
                    .unwrap_or_else(|| Duration::from_millis(backoff.max_delay_ms));
                warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );
                if !cancellable_sleep(delay, cancel).await {
                    return Err(e);
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 1,
            max_delay_ms: 2,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_is_capped_and_unbounded() {
        let config = BackoffConfig {
            initial_delay_ms: 2000,
            max_delay_ms: 5000,
            multiplier: 2.0,
            jitter: 0.0,
        };
        let mut backoff = config.build();

        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(2000)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(4000)));
        for _ in 0..20 {
            assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(5000)));
        }
    }

    #[test]
    fn test_policy_attempts() {
        let mut handling = FailureHandling::default();
        assert_eq!(handling.policy, FailurePolicy::Drop);
        assert_eq!(handling.attempts(), 1);

        handling.policy = FailurePolicy::Retry;
        handling.max_attempts = 4;
        assert_eq!(handling.attempts(), 4);

        handling.max_attempts = 0;
        assert_eq!(handling.attempts(), 1);
    }

    #[test]
    fn test_policy_deserialize() {
        let handling: FailureHandling =
            serde_json::from_str(r#"{"policy": "dead_letter", "max_attempts": 2}"#).unwrap();
        assert_eq!(handling.policy, FailurePolicy::DeadLetter);
        assert_eq!(handling.attempts(), 2);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<u32, String> = retry_with_backoff(3, &fast_backoff(), &cancel, |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_last_error() {
        let cancel = CancellationToken::new();
        let result: Result<(), String> = retry_with_backoff(2, &fast_backoff(), &cancel, |n| async move {
            Err(format!("failure {n}"))
        })
        .await;

        assert_eq!(result, Err("failure 2".to_string()));
    }

    #[tokio::test]
    async fn test_retry_stops_when_cancelled() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), &str> = retry_with_backoff(5, &fast_backoff(), &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("down") }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellable_sleep() {
        let cancel = CancellationToken::new();
        assert!(cancellable_sleep(Duration::from_millis(1), &cancel).await);

        cancel.cancel();
        assert!(!cancellable_sleep(Duration::from_secs(60), &cancel).await);
    }
}
