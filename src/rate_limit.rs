use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::trace;

use crate::resolution::ProviderId;

/// At most `max_calls` calls may begin inside any rolling `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub max_calls: u32,
    pub period: Duration,
}

impl Quota {
    pub fn new(max_calls: u32, period: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            period,
        }
    }

    pub fn per_second(max_calls: u32) -> Self {
        Self::new(max_calls, Duration::from_secs(1))
    }

    pub fn per_minute(max_calls: u32) -> Self {
        Self::new(max_calls, Duration::from_secs(60))
    }
}

pub struct RateLimiter {
    quota: Quota,
    history: AsyncMutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(quota: Quota) -> Self {
        Self {
            quota,
            history: AsyncMutex::new(VecDeque::with_capacity(quota.max_calls as usize)),
        }
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// Waits until a slot inside the window is free, then claims it.
    ///
    /// The history lock is held across the sleep; waiters are served in
    /// arrival order.
    pub async fn acquire(&self) {
        let mut history = self.history.lock().await;
        loop {
            let now = Instant::now();
            self.prune(&mut history, now);
            if history.len() < self.quota.max_calls as usize {
                history.push_back(now);
                return;
            }
            let Some(oldest) = history.front().copied() else {
                continue;
            };
            let wait = (oldest + self.quota.period).saturating_duration_since(now);
            trace!(
                target: "rate_limit",
                wait_ms = wait.as_millis() as u64,
                "call window full; waiting"
            );
            sleep(wait).await;
        }
    }

    /// Claims a slot only if one is free right now.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut history) = self.history.try_lock() else {
            return false;
        };
        let now = Instant::now();
        self.prune(&mut history, now);
        if history.len() < self.quota.max_calls as usize {
            history.push_back(now);
            true
        } else {
            false
        }
    }

    fn prune(&self, history: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = history.front() {
            if now.duration_since(*front) >= self.quota.period {
                history.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Limiters keyed by provider, shared by every resolution of one engine.
#[derive(Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<ProviderId, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the provider's limiter, creating it with `quota` on first use.
    /// An existing limiter keeps its original quota.
    pub fn register(&self, provider: &ProviderId, quota: Quota) -> Arc<RateLimiter> {
        self.limiters
            .lock()
            .entry(provider.clone())
            .or_insert_with(|| Arc::new(RateLimiter::new(quota)))
            .clone()
    }

    pub fn get(&self, provider: &ProviderId) -> Option<Arc<RateLimiter>> {
        self.limiters.lock().get(provider).cloned()
    }

    /// Providers without a registered quota are not gated.
    pub async fn acquire(&self, provider: &ProviderId) {
        if let Some(limiter) = self.get(provider) {
            limiter.acquire().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_window_respected(mut starts: Vec<Instant>, quota: Quota) {
        starts.sort();
        let n = quota.max_calls as usize;
        for window in starts.windows(n + 1) {
            let span = window[n].duration_since(window[0]);
            assert!(
                span >= quota.period,
                "{} calls began within {:?}",
                n + 1,
                span
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_quota_within_window() {
        let quota = Quota::new(2, Duration::from_secs(1));
        let limiter = RateLimiter::new(quota);
        let mut starts = Vec::new();
        for _ in 0..7 {
            limiter.acquire().await;
            starts.push(Instant::now());
        }
        assert_window_respected(starts, quota);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_window() {
        let quota = Quota::per_second(1);
        let limiter = Arc::new(RateLimiter::new(quota));
        let starts = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            let starts = starts.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                starts.lock().push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let starts = starts.lock().clone();
        assert_eq!(starts.len(), 5);
        assert_window_respected(starts, quota);
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_fails_fast_when_full() {
        let limiter = RateLimiter::new(Quota::new(1, Duration::from_secs(60)));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn registry_reuses_limiter_per_provider() {
        let registry = RateLimiterRegistry::new();
        let first = registry.register(&ProviderId::NOMINATIM, Quota::per_second(1));
        let second = registry.register(&ProviderId::NOMINATIM, Quota::per_second(50));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.quota().max_calls, 1);

        let begin = Instant::now();
        registry.acquire(&ProviderId::NOMINATIM).await;
        registry.acquire(&ProviderId::NOMINATIM).await;
        assert!(begin.elapsed() >= Duration::from_secs(1));

        // unregistered providers pass straight through
        let begin = Instant::now();
        registry.acquire(&ProviderId::GOOGLE).await;
        assert_eq!(begin.elapsed(), Duration::ZERO);
    }
}
