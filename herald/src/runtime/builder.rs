use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{HeraldConfig, RetentionConfig};
use crate::events::{InProcEventBus, JobEventPublisher};
use crate::queue::JobStore;
use crate::rate_limit::{RateLimitConfig, RateLimiter, SlidingWindowRateLimiter};
use crate::retry::{RetryController, RetryPolicy};

use super::supervisor::{
    JobDispatcher, PoolShared, ShutdownToken, WorkerPool, WorkerPoolConfig,
};

/// Builder for constructing a [`WorkerPool`] with explicit dependencies.
///
/// The store and dispatcher are required. Everything else has a default:
/// a [`SlidingWindowRateLimiter`] with the default limits, an
/// [`InProcEventBus`], the default [`RetryPolicy`] and [`RetentionConfig`].
///
/// # Example
///
/// ```ignore
/// use herald::*;
///
/// let pool = WorkerPoolBuilder::from_config(&config)
///     .with_store(store)
///     .with_dispatcher(registry)
///     .build()?;
/// pool.start().await?;
/// ```
pub struct WorkerPoolBuilder<S, D>
where
    S: JobStore + 'static,
    D: JobDispatcher + 'static,
{
    config: WorkerPoolConfig,
    retention: RetentionConfig,
    retry: RetryPolicy,
    rate_limit: RateLimitConfig,
    recheck_delay: Option<Duration>,
    worker_prefix: String,
    store: Option<Arc<S>>,
    dispatcher: Option<Arc<D>>,
    limiter: Option<Arc<dyn RateLimiter>>,
    events: Option<Arc<dyn JobEventPublisher>>,
}

impl<S, D> fmt::Debug for WorkerPoolBuilder<S, D>
where
    S: JobStore + 'static,
    D: JobDispatcher + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("WorkerPoolBuilder");
        debug.field("config", &self.config);
        debug.field("retention", &self.retention);
        debug.field("retry", &self.retry);
        debug.field("rate_limit", &self.rate_limit);
        debug.field("worker_prefix", &self.worker_prefix);
        debug.field("store_set", &self.store.is_some());
        debug.field("dispatcher_set", &self.dispatcher.is_some());
        debug.field("limiter_set", &self.limiter.is_some());
        debug.field("events_set", &self.events.is_some());

        if self.store.is_some() {
            debug.field("store_type", &type_name::<S>());
        }
        if self.dispatcher.is_some() {
            debug.field("dispatcher_type", &type_name::<D>());
        }

        debug.finish()
    }
}

impl<S, D> WorkerPoolBuilder<S, D>
where
    S: JobStore + 'static,
    D: JobDispatcher + 'static,
{
    /// Create a new builder with the given pool configuration.
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            retention: RetentionConfig::default(),
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            recheck_delay: None,
            worker_prefix: "herald".to_string(),
            store: None,
            dispatcher: None,
            limiter: None,
            events: None,
        }
    }

    /// Start from every runtime setting in a loaded [`HeraldConfig`].
    pub fn from_config(config: &HeraldConfig) -> Self {
        Self::new(config.runtime.clone())
            .with_retention(config.retention.clone())
            .with_retry_policy(config.retry.clone())
            .with_rate_limit(config.rate_limit.clone())
    }

    /// Set the job store.
    pub fn with_store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the job dispatcher.
    pub fn with_dispatcher(mut self, dispatcher: Arc<D>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Use a custom rate limiter. Overrides [`with_rate_limit`](Self::with_rate_limit).
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Limits for the default sliding-window limiter.
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// How long a rate-limited worker waits before asking again.
    pub fn with_recheck_delay(mut self, delay: Duration) -> Self {
        self.recheck_delay = Some(delay);
        self
    }

    /// Set the event publisher.
    pub fn with_events(mut self, events: Arc<dyn JobEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_config(mut self, config: WorkerPoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Prefix for worker ids; workers are named `{prefix}-w{n}`.
    pub fn with_worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_prefix = prefix.into();
        self
    }

    /// Build the `WorkerPool` with all configured dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or dispatcher is missing.
    pub fn build(self) -> anyhow::Result<WorkerPool<S, D>> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let dispatcher = self
            .dispatcher
            .ok_or_else(|| anyhow::anyhow!("dispatcher dependency missing"))?;

        let recheck_delay = self
            .recheck_delay
            .unwrap_or_else(|| self.rate_limit.recheck_delay());
        let limiter = self.limiter.unwrap_or_else(|| {
            Arc::new(SlidingWindowRateLimiter::new(self.rate_limit.clone()))
        });
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InProcEventBus::default()));

        let shared = PoolShared {
            config: self.config,
            retention: self.retention,
            store,
            dispatcher,
            limiter,
            recheck_delay,
            events,
            retry: RetryController::new(self.retry),
            shutdown: ShutdownToken::new(),
        };

        Ok(WorkerPool::from_parts(shared, self.worker_prefix))
    }
}
