use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryPolicy;
use crate::runtime::WorkerPoolConfig;

/// How many finished jobs the store keeps around for audit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Most recent completed jobs to keep.
    pub keep_completed: usize,
    /// Most recent dead-lettered jobs to keep.
    pub keep_dead_lettered: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_completed: 100,
            keep_dead_lettered: 50,
        }
    }
}

/// Outbound webhook delivery settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Request timeout in milliseconds. Zero means the 30s default.
    pub timeout_ms: u64,
    /// Value sent as `X-Webhook-Secret` unless the job supplies its own.
    pub secret: Option<String>,
    /// Key used to sign the body into `X-Webhook-Signature`.
    pub signing_key: Option<String>,
}

impl WebhookConfig {
    pub fn timeout(&self) -> std::time::Duration {
        match self.timeout_ms {
            0 => std::time::Duration::from_secs(30),
            ms => std::time::Duration::from_millis(ms),
        }
    }
}

/// Text-generation provider settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_ms: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_ms: 60_000,
        }
    }
}

/// HTTP mail API settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub from: String,
    pub timeout_ms: u64,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            from: "notifications@localhost".to_string(),
            timeout_ms: 15_000,
        }
    }
}

/// Top-level configuration for the job subsystem.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeraldConfig {
    pub runtime: WorkerPoolConfig,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitConfig,
    pub retention: RetentionConfig,
    pub webhook: WebhookConfig,
    pub ai: AiConfig,
    pub mail: MailConfig,
}

impl HeraldConfig {
    /// Load configuration from `HERALD_*` environment variables on top of
    /// the defaults. A `.env` file is honoured when present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = Self::default();

        let runtime = &mut config.runtime;
        override_parsed("HERALD_CONCURRENCY", &mut runtime.concurrency)?;
        override_parsed("HERALD_BATCH_SIZE", &mut runtime.batch_size)?;
        override_parsed("HERALD_LEASE_TTL_MS", &mut runtime.lease_ttl_ms)?;
        override_parsed("HERALD_POLL_INTERVAL_MS", &mut runtime.poll_interval_ms)?;
        override_parsed("HERALD_MAX_POLL_INTERVAL_MS", &mut runtime.max_poll_interval_ms)?;
        override_parsed("HERALD_HOUSEKEEPER_INTERVAL_MS", &mut runtime.housekeeper_interval_ms)?;
        override_parsed("HERALD_SHUTDOWN_TIMEOUT_MS", &mut runtime.shutdown_timeout_ms)?;

        override_parsed("HERALD_RETRY_BASE_DELAY_MS", &mut config.retry.base_delay_ms)?;
        override_parsed("HERALD_RETRY_MAX_BACKOFF_MS", &mut config.retry.max_backoff_ms)?;

        let rate_limit = &mut config.rate_limit;
        override_parsed("HERALD_RATE_LIMIT_MAX_EVENTS", &mut rate_limit.max_events)?;
        override_parsed("HERALD_RATE_LIMIT_WINDOW_MS", &mut rate_limit.window_ms)?;
        override_parsed("HERALD_RATE_LIMIT_RECHECK_MS", &mut rate_limit.recheck_delay_ms)?;
        if let Some(limit) = parse_var::<usize>("HERALD_RATE_LIMIT_PER_TENANT")? {
            rate_limit.per_tenant_max_events = Some(limit);
        }

        override_parsed("HERALD_KEEP_COMPLETED", &mut config.retention.keep_completed)?;
        override_parsed("HERALD_KEEP_DEAD_LETTERED", &mut config.retention.keep_dead_lettered)?;

        override_parsed("HERALD_WEBHOOK_TIMEOUT_MS", &mut config.webhook.timeout_ms)?;
        config.webhook.secret = env::var("HERALD_WEBHOOK_SECRET").ok();
        config.webhook.signing_key = env::var("HERALD_WEBHOOK_SIGNING_KEY").ok();

        config.ai.api_key = env::var("OPENAI_API_KEY").ok();
        if let Ok(base_url) = env::var("HERALD_AI_BASE_URL") {
            config.ai.base_url = base_url;
        }
        if let Ok(model) = env::var("HERALD_AI_MODEL") {
            config.ai.model = model;
        }
        override_parsed("HERALD_AI_TIMEOUT_MS", &mut config.ai.timeout_ms)?;

        config.mail.endpoint = env::var("HERALD_MAIL_ENDPOINT").ok();
        config.mail.api_key = env::var("HERALD_MAIL_API_KEY").ok();
        if let Ok(from) = env::var("HERALD_MAIL_FROM") {
            config.mail.from = from;
        }
        override_parsed("HERALD_MAIL_TIMEOUT_MS", &mut config.mail.timeout_ms)?;

        Ok(config)
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("{name} must be a valid number, got `{raw}`")),
        Err(_) => Ok(None),
    }
}

fn override_parsed<T>(name: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = parse_var(name)? {
        *slot = value;
    }
    Ok(())
}
