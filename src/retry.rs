//! Bounded retry for eventually consistent reads.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How long to wait after a failed attempt, indexed from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

impl Delay {
    pub fn after_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Delay::Fixed(delay) => delay,
            Delay::Exponential { base, max } => base
                .checked_mul(2u32.saturating_pow(attempt))
                .map_or(max, |delay| delay.min(max)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Delay,
}

/// Returned once every attempt has been spent.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    /// The error of the final attempt, if it failed rather than returning a
    /// retryable value.
    pub last_error: Option<E>,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay: Delay::Fixed(delay),
        }
    }

    /// Runs `op` until it yields a value that `is_retryable` rejects, or the
    /// attempt budget is spent. Errors from `op` are always retried. No sleep
    /// follows the final attempt.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, is_retryable: P) -> Result<T, Exhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&T) -> bool,
        E: Display,
    {
        let mut last_error = None;
        for attempt in 0..self.max_attempts {
            match op(attempt).await {
                Ok(value) if !is_retryable(&value) => return Ok(value),
                Ok(_) => {
                    tracing::debug!(attempt, "attempt returned a retryable value");
                    last_error = None;
                }
                Err(e) => {
                    tracing::debug!(attempt, "attempt failed: {e}");
                    last_error = Some(e);
                }
            }

            if attempt + 1 < self.max_attempts {
                tokio::time::sleep(self.delay.after_attempt(attempt)).await;
            }
        }

        Err(Exhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_always_empty_spends_every_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(11, Duration::from_secs(3));
        let start = tokio::time::Instant::now();

        let res = policy
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, String>(String::new()) }
                },
                |value: &String| value.is_empty(),
            )
            .await;

        let err = res.unwrap_err();
        assert_eq!(err.attempts, 11);
        assert!(err.last_error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 11);
        // ten gaps between eleven attempts
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_retried_and_last_one_kept() {
        let policy = RetryPolicy::fixed(4, Duration::from_millis(250));
        let res = policy
            .run(
                |attempt| async move { Err::<u32, _>(format!("boom {attempt}")) },
                |_| false,
            )
            .await;

        let err = res.unwrap_err();
        assert_eq!(err.attempts, 4);
        assert_eq!(err.last_error.as_deref(), Some("boom 3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_first_accepted_value() {
        let policy = RetryPolicy::fixed(11, Duration::from_secs(1));
        let start = tokio::time::Instant::now();

        let res = policy
            .run(
                |attempt| async move {
                    if attempt < 2 {
                        Ok::<_, String>("not found".to_string())
                    } else {
                        Ok("10.0.0.7".to_string())
                    }
                },
                |value: &String| value.contains("not found"),
            )
            .await;

        assert_eq!(res.unwrap(), "10.0.0.7");
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let delay = Delay::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(delay.after_attempt(0), Duration::from_millis(100));
        assert_eq!(delay.after_attempt(2), Duration::from_millis(400));
        assert_eq!(delay.after_attempt(10), Duration::from_secs(1));
        assert_eq!(delay.after_attempt(40), Duration::from_secs(1));
    }
}
