//! Retry with exponential backoff for backend calls.
//!
//! Only errors the backend marks as transient are retried; permanent errors
//! fail on the first attempt.

use crate::{AgentError, BackendError};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff schedule for backend calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first (minimum 1).
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Backoff multiplier applied per attempt.
    pub multiplier: f64,
    /// Scale delays by a fixed per-attempt factor to spread out retries.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// No waiting between attempts.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
            ..Self::with_attempts(attempts)
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if !self.jitter {
            return Duration::from_secs_f64(capped);
        }
        let factor = match attempt % 4 {
            0 => 0.75,
            1 => 0.90,
            2 => 0.60,
            _ => 0.85,
        };
        Duration::from_secs_f64(capped * factor)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, AgentError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.transient && attempt < max_attempts => {
                    let delay = self.delay_for_attempt(attempt - 1);
                    warn!(
                        "Backend attempt {attempt}/{max_attempts} failed: {e}; retrying in {:.0}ms",
                        delay.as_secs_f64() * 1000.0
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(source) => {
                    return Err(AgentError::Backend {
                        attempts: attempt,
                        source,
                    });
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
    fn attempts_are_at_least_one() {
        assert_eq!(RetryConfig::with_attempts(0).max_attempts, 1);
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let config = RetryConfig {
            jitter: false,
            max_delay: Duration::from_secs(2),
            ..RetryConfig::with_attempts(5)
        };
        assert!(config.delay_for_attempt(1) > config.delay_for_attempt(0));
        assert!(config.delay_for_attempt(10) <= Duration::from_secs(2));
    }

    #[test]
    fn jitter_never_lengthens_delay() {
        let jittered = RetryConfig::with_attempts(3);
        let plain = RetryConfig {
            jitter: false,
            ..RetryConfig::with_attempts(3)
        };
        for attempt in 0..6 {
            assert!(jittered.delay_for_attempt(attempt) <= plain.delay_for_attempt(attempt));
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let out = RetryConfig::immediate(3)
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(BackendError::transient("HTTP 503"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let calls = AtomicU32::new(0);
        let err = RetryConfig::immediate(5)
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(BackendError::permanent("HTTP 401")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, AgentError::Backend { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let err = RetryConfig::immediate(2)
            .run(|_| async { Err::<(), _>(BackendError::transient("timed out")) })
            .await
            .unwrap_err();
        match err {
            AgentError::Backend { attempts, source } => {
                assert_eq!(attempts, 2);
                assert!(source.transient);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
