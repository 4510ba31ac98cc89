//! Herald - tenant-scoped background job processing.
//!
//! Request handlers submit jobs (email, webhook delivery, AI processing)
//! through a [`JobClient`]. A [`WorkerPool`] leases them from a [`JobStore`],
//! waits on a shared [`RateLimiter`], runs the matching handler and settles
//! the outcome through the [`RetryController`].
//!
//! # Core Concepts
//!
//! - **Job Store**: [`JobStore`] is the single source of truth for job
//!   state. Workers claim jobs with time-bound leases; a lease that expires
//!   (crashed worker) is reaped back to the queue without spending an
//!   attempt. [`InMemoryJobStore`] ships by default, `PostgresJobStore`
//!   behind the `postgres` feature.
//!
//! - **Handlers**: one [`JobHandler`] per [`JobType`], collected in a
//!   [`HandlerRegistry`] that must cover every type. Handlers report
//!   outcomes as [`JobError`] values: `Transient` is retried, everything
//!   else is final.
//!
//! - **Retry**: exponential backoff (`base * 2^(attempt-1)`, capped) until
//!   `max_attempts`, then dead letter.
//!
//! - **Events**: every lifecycle transition is published as a [`JobEvent`]
//!   on a [`JobEventPublisher`], correlated by job id.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL job store via sqlx
//! - `metrics` - Prometheus metrics
//!
//! # Example
//!
//! ```ignore
//! use herald::*;
//! use std::sync::Arc;
//!
//! let config = HeraldConfig::from_env()?;
//! let store = Arc::new(InMemoryJobStore::new());
//! let events = Arc::new(InProcEventBus::default());
//!
//! let registry = HandlerRegistry::builder()
//!     .with_handler(Arc::new(EmailHandler::new(TemplateRegistry::with_defaults(), mail)))
//!     .with_handler(Arc::new(WebhookHandler::new(&config.webhook)?))
//!     .with_handler(Arc::new(AiProcessingHandler::new(generator, results)))
//!     .build()?;
//!
//! let pool = WorkerPoolBuilder::from_config(&config)
//!     .with_store(store.clone())
//!     .with_dispatcher(Arc::new(registry))
//!     .with_events(events.clone())
//!     .build()?;
//! pool.start().await?;
//!
//! let client = JobClient::new(store, events);
//! client.add_webhook_job(payload).await?;
//! ```

/// Activity log written after each successful job.
pub mod activity;

/// Configuration loaded from defaults and `HERALD_*` environment variables.
pub mod config;

/// Producer-facing enqueue API.
pub mod enqueue;

/// Error taxonomy for validation, job execution and enqueueing.
pub mod error;

/// Job lifecycle events and the in-process event bus.
pub mod events;

/// Job handlers for each job type and the registry that dispatches to them.
pub mod handlers;

/// Core job types: identifiers, payloads, states and records.
pub mod job;

/// Leases handed to workers and lease expiry handling.
pub mod lease;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Job store implementations.
pub mod persistence;

/// The [`JobStore`] trait and queue snapshots.
pub mod queue;

/// Sliding-window rate limiting of job execution.
pub mod rate_limit;

/// Backoff policy and retry decisions.
pub mod retry;

/// Worker pool, worker loop and housekeeper.
pub mod runtime;

/// Tracing spans and telemetry hooks.
pub mod telemetry;

pub use activity::*;
pub use config::*;
pub use enqueue::*;
pub use error::*;
pub use events::*;
pub use handlers::{
    AiProcessingHandler, AiResultStore, EmailHandler, EmailTemplate, HandlerRegistry,
    HandlerRegistryBuilder, HandlerSuccess, HttpMailTransport, JobContext, JobHandler, MailError,
    MailTransport, OpenAiTextGenerator, ProviderError, TemplateRegistry, TextGenerator,
    WebhookHandler,
};
pub use job::*;
pub use lease::*;
pub use persistence::*;
pub use queue::*;
pub use rate_limit::*;
pub use retry::*;
pub use runtime::*;
