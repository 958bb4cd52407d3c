use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::config::RetryConfig;
use crate::error::GenerationError;

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp(GenerationError),
}

/// Bounded exponential backoff. `decide` is a pure function of the attempt
/// number, the failure and a jitter sample; `run` drives it with tokio's
/// clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: f64,
    multiplier: f64,
    max_delay_ms: f64,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms as f64,
            multiplier: config.multiplier.max(1.0),
            max_delay_ms: config.max_delay_ms as f64,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Un-jittered delay after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let ms = (self.base_delay_ms * self.multiplier.powi(exponent)).min(self.max_delay_ms);
        Duration::from_millis(ms.max(0.0).round() as u64)
    }

    /// `jitter_sample` is in `[-1, 1]`; the provider hint wins when longer.
    pub fn delay_for(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
        jitter_sample: f64,
    ) -> Duration {
        let factor = 1.0 + self.jitter * jitter_sample.clamp(-1.0, 1.0);
        let ms = self.backoff(attempt).as_millis() as f64 * factor;
        let delay = Duration::from_millis(ms.max(0.0).round() as u64);
        match retry_after {
            Some(hint) if hint > delay => hint,
            _ => delay,
        }
    }

    pub fn decide(&self, attempt: u32, err: GenerationError, jitter_sample: f64) -> RetryDecision {
        if !err.is_retryable() {
            return RetryDecision::GiveUp(err);
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp(GenerationError::RetriesExhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }
        RetryDecision::Retry(self.delay_for(attempt, err.retry_after(), jitter_sample))
    }

    /// Runs `op` until it succeeds or the policy gives up. Returns the final
    /// result and the number of attempts made.
    pub async fn run<T, F, Fut>(&self, op: F) -> (Result<T, GenerationError>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        self.run_observed(op, |_, _, _| {}).await
    }

    /// Like `run`, calling `observe(attempt, error, next_delay)` after each
    /// failed attempt. `next_delay` is `None` when no retry follows.
    pub async fn run_observed<T, F, Fut, O>(
        &self,
        mut op: F,
        mut observe: O,
    ) -> (Result<T, GenerationError>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
        O: FnMut(u32, &GenerationError, Option<Duration>),
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(err) => err,
            };
            match self.decide(attempt, err.clone(), sample_jitter()) {
                RetryDecision::Retry(delay) => {
                    observe(attempt, &err, Some(delay));
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying generation"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp(final_err) => {
                    observe(attempt, &err, None);
                    return (Err(final_err), attempt);
                }
            }
        }
    }
}

fn sample_jitter() -> f64 {
    rand::random::<f64>() * 2.0 - 1.0
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::config::RetryConfig;
    use crate::error::GenerationError;

    use super::{RetryDecision, RetryPolicy};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_attempts,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1000,
            jitter: 0.0,
        })
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = policy(10);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_scales_within_bounds() {
        let policy = RetryPolicy::new(&RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.2,
        });
        assert_eq!(policy.delay_for(1, None, -1.0), Duration::from_millis(800));
        assert_eq!(policy.delay_for(1, None, 1.0), Duration::from_millis(1200));
        assert_eq!(policy.delay_for(1, None, 0.0), Duration::from_millis(1000));
    }

    #[test]
    fn retry_after_hint_wins_when_longer() {
        let policy = policy(3);
        let err = GenerationError::rate_limited("429", Some(Duration::from_secs(5)));
        assert_eq!(
            policy.decide(1, err, 0.0),
            RetryDecision::Retry(Duration::from_secs(5))
        );
        let short = GenerationError::rate_limited("429", Some(Duration::from_millis(10)));
        assert_eq!(
            policy.decide(1, short, 0.0),
            RetryDecision::Retry(Duration::from_millis(100))
        );
    }

    #[test]
    fn decide_gives_up_on_permanent_failures() {
        let policy = policy(3);
        let rejected = GenerationError::ContentRejected("nsfw".to_string());
        assert_eq!(
            policy.decide(1, rejected.clone(), 0.0),
            RetryDecision::GiveUp(rejected)
        );
        match policy.decide(3, GenerationError::TransientFailure("503".to_string()), 0.0) {
            RetryDecision::GiveUp(GenerationError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(*last, GenerationError::TransientFailure("503".to_string()));
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_use_every_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let started = Instant::now();
        let (result, attempts) = policy(4)
            .run(move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GenerationError::TransientFailure("502".to_string()))
            })
            .await;

        assert_eq!(attempts, 4);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert!(matches!(
            result,
            Err(GenerationError::RetriesExhausted { attempts: 4, .. })
        ));
        assert!(started.elapsed() >= Duration::from_millis(100 + 200 + 400));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_request_is_attempted_once() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, attempts) = policy(4)
            .run(move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GenerationError::InvalidRequest("bad size".to_string()))
            })
            .await;

        assert_eq!(attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(
            result,
            Err(GenerationError::InvalidRequest("bad size".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let mut observed = Vec::new();
        let (result, attempts) = policy(3)
            .run_observed(
                |attempt| async move {
                    if attempt < 3 {
                        Err(GenerationError::rate_limited("429", None))
                    } else {
                        Ok(attempt)
                    }
                },
                |attempt, _, delay| observed.push((attempt, delay)),
            )
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(attempts, 3);
        assert_eq!(
            observed,
            vec![
                (1, Some(Duration::from_millis(100))),
                (2, Some(Duration::from_millis(200)))
            ]
        );
    }
}
