use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

use crate::job::TenantId;

/// Configuration for the sliding-window rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum job executions in any window, across all tenants.
    pub max_events: usize,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Optional cap per tenant within the same window.
    pub per_tenant_max_events: Option<usize>,
    /// How long a denied worker waits before asking again.
    pub recheck_delay_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_events: 100,
            window_ms: 60_000,
            per_tenant_max_events: None,
            recheck_delay_ms: 250,
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            max_events,
            window_ms: window.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Add a per-tenant limit
    pub fn with_per_tenant_limit(mut self, limit: usize) -> Self {
        self.per_tenant_max_events = Some(limit);
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn recheck_delay(&self) -> Duration {
        Duration::from_millis(self.recheck_delay_ms)
    }
}

/// Bounds how many jobs may start executing per unit of time.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record an execution for `tenant_id` if every applicable window has
    /// room. Returns false, recording nothing, when any window is full.
    async fn try_acquire(&self, tenant_id: &TenantId) -> bool;

    /// Get current global utilization
    /// Returns (current, limit)
    async fn utilization(&self) -> (usize, usize);
}

/// Sliding-window log limiter shared by every worker in the pool.
///
/// Keeps the timestamp of each admitted event and discards those older
/// than the window, so no interval of `window` length ever contains more
/// than `max_events` admissions.
pub struct SlidingWindowRateLimiter {
    config: RateLimitConfig,
    windows: Arc<Mutex<Windows>>,
}

#[derive(Debug, Default)]
struct Windows {
    global: VecDeque<Instant>,
    tenants: HashMap<TenantId, VecDeque<Instant>>,
}

fn evict(events: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = events.front() {
        if now.duration_since(*oldest) >= window {
            events.pop_front();
        } else {
            break;
        }
    }
}

impl std::fmt::Debug for SlidingWindowRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("SlidingWindowRateLimiter");
        debug.field("config", &self.config);

        match self.windows.try_lock() {
            Some(windows) => {
                debug.field("global", &windows.global.len());
                debug.field("tenants", &windows.tenants.len());
            }
            None => {
                debug.field("windows", &"<locked>");
            }
        }

        debug.finish_non_exhaustive()
    }
}

impl SlidingWindowRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Arc::new(Mutex::new(Windows::default())),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn acquire_at(&self, tenant_id: &TenantId, now: Instant) -> bool {
        let window = self.config.window();
        let mut windows = self.windows.lock();

        evict(&mut windows.global, now, window);
        if windows.global.len() >= self.config.max_events {
            return false;
        }

        if let Some(limit) = self.config.per_tenant_max_events {
            let tenant = windows.tenants.entry(tenant_id.clone()).or_default();
            evict(tenant, now, window);
            if tenant.len() >= limit {
                return false;
            }
            tenant.push_back(now);
        }

        windows.global.push_back(now);

        // Drop tenants that went quiet so the map does not grow without bound.
        if windows.tenants.len() > 1024 {
            windows.tenants.retain(|_, events| {
                evict(events, now, window);
                !events.is_empty()
            });
        }
        true
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn try_acquire(&self, tenant_id: &TenantId) -> bool {
        self.acquire_at(tenant_id, Instant::now())
    }

    async fn utilization(&self) -> (usize, usize) {
        let mut windows = self.windows.lock();
        evict(&mut windows.global, Instant::now(), self.config.window());
        (windows.global.len(), self.config.max_events)
    }
}

/// Limiter that admits everything. Useful when throughput is bounded elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn try_acquire(&self, _tenant_id: &TenantId) -> bool {
        true
    }

    async fn utilization(&self) -> (usize, usize) {
        (0, usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::from(id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_exactly_max_events_per_window() {
        let limiter = SlidingWindowRateLimiter::new(RateLimitConfig::new(
            100,
            Duration::from_secs(60),
        ));

        let mut admitted = 0;
        for _ in 0..(100 + 25) {
            if limiter.try_acquire(&tenant("acme")).await {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 100);
        assert_eq!(limiter.utilization().await, (100, 100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter =
            SlidingWindowRateLimiter::new(RateLimitConfig::new(2, Duration::from_secs(10)));

        assert!(limiter.try_acquire(&tenant("a")).await);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.try_acquire(&tenant("a")).await);
        assert!(!limiter.try_acquire(&tenant("a")).await);

        // First event leaves the window; the second is still inside it.
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(limiter.try_acquire(&tenant("a")).await);
        assert!(!limiter.try_acquire(&tenant("a")).await);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.utilization().await, (0, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_tenant_limit_isolated() {
        let limiter = SlidingWindowRateLimiter::new(
            RateLimitConfig::new(10, Duration::from_secs(60)).with_per_tenant_limit(2),
        );

        assert!(limiter.try_acquire(&tenant("a")).await);
        assert!(limiter.try_acquire(&tenant("a")).await);
        assert!(!limiter.try_acquire(&tenant("a")).await);
        assert!(limiter.try_acquire(&tenant("b")).await);

        // Tenant denial must not consume a global slot.
        assert_eq!(limiter.utilization().await, (3, 10));
    }

    #[tokio::test]
    async fn test_concurrent_acquisitions_respect_cap() {
        let limiter = Arc::new(SlidingWindowRateLimiter::new(RateLimitConfig::new(
            50,
            Duration::from_secs(60),
        )));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move {
                let mut ok = 0;
                for _ in 0..20 {
                    if limiter.try_acquire(&TenantId::new(format!("t{i}"))).await {
                        ok += 1;
                    }
                }
                ok
            }));
        }

        let mut total = 0;
        for task in tasks {
            total += task.await.unwrap();
        }
        assert_eq!(total, 50);
    }
}
