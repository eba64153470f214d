//! Bounded retry for broker connection bootstrap.
//!
//! Both the publisher and the consumer dial the broker through the same
//! [`RetryPolicy`], so startup behavior is defined in one place.

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Default number of connection attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;

/// Default delay between attempts in milliseconds.
pub const DEFAULT_DELAY_MS: u64 = 2000;

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_delay_ms() -> u64 {
    DEFAULT_DELAY_MS
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAX_ATTEMPTS, Duration::from_millis(DEFAULT_DELAY_MS))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: base.as_millis() as u64,
            backoff: Backoff::Exponential,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.delay_ms;
        let delay_ms = match self.backoff {
            Backoff::Fixed => base,
            // Capped at 32x the base delay
            Backoff::Exponential => base.saturating_mul(1 << attempt.saturating_sub(1).min(5)),
        };
        Duration::from_millis(delay_ms)
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// Returns the last error once `max_attempts` have failed. A policy with
    /// `max_attempts == 0` still makes a single attempt.
    pub async fn retry<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        target_name = %what,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 30);
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(29), Duration::from_secs(2));
    }

    #[test]
    fn test_exponential_delay() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(4), Duration::from_millis(800));
        assert_eq!(policy.delay_after(20), Duration::from_millis(3200));
    }

    #[test]
    fn test_parse_policy() {
        let policy: RetryPolicy = toml::from_str(
            r#"
            max_attempts = 5
            backoff = "exponential"
        "#,
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_ms, 2000);
        assert_eq!(policy.backoff, Backoff::Exponential);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = RetryPolicy::fixed(5, Duration::from_secs(2));

        let result: Result<u32, String> = policy
            .retry("test", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n} refused"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = RetryPolicy::fixed(4, Duration::from_secs(2));

        let result: Result<(), String> = policy
            .retry("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("refused".to_string())
            })
            .await;

        assert_eq!(result, Err("refused".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_tries_once() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = RetryPolicy::fixed(0, Duration::from_secs(1));

        let _: Result<(), &str> = policy
            .retry("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope")
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
