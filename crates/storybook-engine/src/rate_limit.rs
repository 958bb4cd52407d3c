use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use storybook_contracts::models::BackendId;
use tokio::time::Instant;

use crate::config::{EngineConfig, RateLimitConfig};

/// Token bucket gating the start of each generation attempt.
///
/// `acquire` reserves a token immediately and sleeps off any deficit, so
/// waiters are served in the order they arrived. A reservation abandoned
/// mid-sleep is not refunded.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    per_second: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    /// `requests_per_minute == 0` builds an unlimited bucket.
    pub fn new(requests_per_minute: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            per_second: f64::from(requests_per_minute) / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 1)
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_minute, config.burst)
    }

    pub fn is_unlimited(&self) -> bool {
        self.per_second <= 0.0
    }

    pub async fn acquire(&self) {
        if let Some(wait) = self.reserve() {
            tokio::time::sleep(wait).await;
        }
    }

    fn reserve(&self) -> Option<Duration> {
        if self.is_unlimited() {
            return None;
        }
        let mut state = self.lock();
        self.refill(&mut state);
        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(-state.tokens / self.per_second))
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.refilled_at);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.per_second).min(self.capacity);
        state.refilled_at = now;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One bucket per backend, shared by every job in the process.
#[derive(Debug, Clone)]
pub struct RateLimiters {
    buckets: BTreeMap<BackendId, Arc<TokenBucket>>,
}

impl RateLimiters {
    pub fn from_config(config: &EngineConfig) -> Self {
        let buckets = BackendId::ALL
            .into_iter()
            .map(|id| {
                (
                    id,
                    Arc::new(TokenBucket::from_config(&config.rate_limit_for(id))),
                )
            })
            .collect();
        Self { buckets }
    }

    pub fn unlimited() -> Self {
        let buckets = BackendId::ALL
            .into_iter()
            .map(|id| (id, Arc::new(TokenBucket::unlimited())))
            .collect();
        Self { buckets }
    }

    pub fn with_bucket(mut self, backend: BackendId, bucket: TokenBucket) -> Self {
        self.buckets.insert(backend, Arc::new(bucket));
        self
    }

    pub fn get(&self, backend: BackendId) -> Arc<TokenBucket> {
        self.buckets
            .get(&backend)
            .cloned()
            .unwrap_or_else(|| Arc::new(TokenBucket::unlimited()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use storybook_contracts::models::BackendId;
    use tokio::time::Instant;

    use crate::config::{EngineConfig, RateLimitConfig};

    use super::{RateLimiters, TokenBucket};

    #[tokio::test(start_paused = true)]
    async fn burst_is_free_then_paced() {
        let bucket = TokenBucket::new(60, 2);
        let started = Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        assert_eq!(started.elapsed(), Duration::ZERO);

        bucket.acquire().await;
        assert!(started.elapsed() >= Duration::from_secs(1));
        bucket.acquire().await;
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_share_one_rate() {
        let bucket = Arc::new(TokenBucket::new(120, 1));
        let started = Instant::now();
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let bucket = bucket.clone();
                tokio::spawn(async move {
                    bucket.acquire().await;
                    Instant::now()
                })
            })
            .collect();
        let mut finished = Vec::new();
        for handle in handles {
            if let Ok(at) = handle.await {
                finished.push(at);
            }
        }
        assert_eq!(finished.len(), 5);
        let last = finished.iter().max().copied().unwrap_or(started);
        assert!(last.duration_since(started) >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_is_unlimited() {
        let bucket = TokenBucket::new(0, 1);
        let started = Instant::now();
        for _ in 0..100 {
            bucket.acquire().await;
        }
        assert!(bucket.is_unlimited());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[test]
    fn limiters_follow_per_backend_overrides() {
        let mut config = EngineConfig::default();
        config.rate_limits.insert(
            BackendId::Dryrun,
            RateLimitConfig {
                requests_per_minute: 0,
                burst: 1,
            },
        );
        let limiters = RateLimiters::from_config(&config);
        assert!(limiters.get(BackendId::Dryrun).is_unlimited());
        assert!(!limiters.get(BackendId::GptImage).is_unlimited());
    }
}
