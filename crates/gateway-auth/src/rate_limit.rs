use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use gateway_core::{now_millis, GatewayError};
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug)]
pub struct RateLimiterConfig {
    pub window: Duration,
    pub limit: u64,
    pub prune_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            limit: 120,
            prune_interval: Duration::from_secs(30),
        }
    }
}

/// The interface the dispatcher calls regardless of which algorithm
/// actually backs it (§4.9: "a pluggable distributed backend is
/// addressable through the same interface").
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    async fn check(&self, subject: &str, cost: u64) -> Result<(), GatewayError>;
}

/// Per-subject sliding window of request timestamps: admit if
/// `count + cost <= limit` within the trailing `window`. A background task
/// periodically prunes subjects whose window has gone fully stale so the
/// map doesn't grow unbounded with one-off callers.
pub struct SlidingWindowRateLimiter {
    cfg: RateLimiterConfig,
    windows: DashMap<String, Mutex<VecDeque<u64>>>,
    pruner: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> std::sync::Arc<Self> {
        let limiter = std::sync::Arc::new(Self {
            cfg,
            windows: DashMap::new(),
            pruner: std::sync::Mutex::new(None),
        });
        limiter.clone().spawn_pruner();
        limiter
    }

    fn spawn_pruner(self: std::sync::Arc<Self>) {
        let interval = self.cfg.prune_interval;
        let window_ms = self.cfg.window.as_millis() as u64;
        let limiter = std::sync::Arc::downgrade(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                limiter.prune_stale_subjects(window_ms);
            }
        });
        if let Ok(mut guard) = self.pruner.lock() {
            *guard = Some(handle);
        }
    }

    fn prune_stale_subjects(&self, window_ms: u64) {
        let now = now_millis();
        let stale: Vec<String> = self
            .windows
            .iter()
            .filter_map(|entry| {
                let timestamps = entry.value().lock().unwrap();
                let fully_stale = timestamps
                    .back()
                    .map(|last| now.saturating_sub(*last) > window_ms)
                    .unwrap_or(true);
                fully_stale.then(|| entry.key().clone())
            })
            .collect();
        for key in stale {
            self.windows.remove(&key);
        }
    }

    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.pruner.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl RateLimitBackend for SlidingWindowRateLimiter {
    async fn check(&self, subject: &str, cost: u64) -> Result<(), GatewayError> {
        let window_ms = self.cfg.window.as_millis() as u64;
        let now = now_millis();

        let entry = self
            .windows
            .entry(subject.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut timestamps = entry.lock().unwrap();

        while let Some(&front) = timestamps.front() {
            if now.saturating_sub(front) > window_ms {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() as u64 + cost > self.cfg.limit {
            let retry_after_ms = timestamps
                .front()
                .map(|front| window_ms.saturating_sub(now.saturating_sub(*front)))
                .unwrap_or(window_ms);
            return Err(GatewayError::RateLimited { retry_after_ms });
        }

        for _ in 0..cost {
            timestamps.push_back(now);
        }
        Ok(())
    }
}

/// The increment-with-expiry primitive a distributed store (e.g. Redis
/// `INCR` + `EXPIRE`) would offer. A fixed-window counter, not a sliding
/// log — coarser than [`SlidingWindowRateLimiter`], but addressable through
/// the same [`RateLimitBackend`] interface via [`FixedWindowBackend`].
#[async_trait]
pub trait IncrementWithExpiry: Send + Sync {
    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, GatewayError>;
}

pub struct FixedWindowBackend<I: IncrementWithExpiry> {
    inner: I,
    cfg: RateLimiterConfig,
}

impl<I: IncrementWithExpiry> FixedWindowBackend<I> {
    pub fn new(inner: I, cfg: RateLimiterConfig) -> Self {
        Self { inner, cfg }
    }
}

#[async_trait]
impl<I: IncrementWithExpiry> RateLimitBackend for FixedWindowBackend<I> {
    async fn check(&self, subject: &str, _cost: u64) -> Result<(), GatewayError> {
        let count = self.inner.increment_with_expiry(subject, self.cfg.window).await?;
        if count > self.cfg.limit {
            Err(GatewayError::RateLimited {
                retry_after_ms: self.cfg.window.as_millis() as u64,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> RateLimiterConfig {
        RateLimiterConfig {
            window: Duration::from_millis(100),
            limit: 3,
            prune_interval: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn admits_up_to_the_limit_then_rejects() {
        let limiter = SlidingWindowRateLimiter::new(test_cfg());
        for _ in 0..3 {
            limiter.check("subject-a", 1).await.unwrap();
        }
        let result = limiter.check("subject-a", 1).await;
        assert!(matches!(result, Err(GatewayError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn window_expiry_makes_room_for_new_requests() {
        let limiter = SlidingWindowRateLimiter::new(test_cfg());
        for _ in 0..3 {
            limiter.check("subject-a", 1).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.check("subject-a", 1).await.is_ok());
    }

    #[tokio::test]
    async fn subjects_have_independent_windows() {
        let limiter = SlidingWindowRateLimiter::new(test_cfg());
        for _ in 0..3 {
            limiter.check("subject-a", 1).await.unwrap();
        }
        assert!(limiter.check("subject-b", 1).await.is_ok());
    }

    #[tokio::test]
    async fn a_cost_greater_than_one_can_exhaust_the_limit_in_one_call() {
        let limiter = SlidingWindowRateLimiter::new(test_cfg());
        assert!(limiter.check("subject-a", 3).await.is_ok());
        assert!(limiter.check("subject-a", 1).await.is_err());
    }

    struct FakeDistributed {
        counter: std::sync::atomic::AtomicU64,
    }

    #[async_trait]
    impl IncrementWithExpiry for FakeDistributed {
        async fn increment_with_expiry(&self, _key: &str, _ttl: Duration) -> Result<u64, GatewayError> {
            Ok(self.counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1)
        }
    }

    #[tokio::test]
    async fn fixed_window_backend_rejects_once_the_counter_exceeds_the_limit() {
        let backend = FixedWindowBackend::new(
            FakeDistributed { counter: std::sync::atomic::AtomicU64::new(0) },
            test_cfg(),
        );
        for _ in 0..3 {
            backend.check("subject-a", 1).await.unwrap();
        }
        assert!(backend.check("subject-a", 1).await.is_err());
    }
}
