//! Job execution strategies, one per [`JobType`].
//!
//! The set of job types is closed, so dispatch goes through a
//! [`HandlerRegistry`] keyed by type rather than open-ended lookup. Every
//! registry is complete: building one without a handler for each type fails.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::activity::{ActivityLog, TracingActivityLog};
use crate::error::JobError;
use crate::job::{JobId, JobPayload, JobType, TenantId};
use crate::lease::{JobLease, LeaseId};
use crate::runtime::{DispatchStatus, JobDispatcher};
use crate::telemetry;

/// Email delivery.
pub mod email;
/// Outbound webhook delivery.
pub mod webhook;
/// AI text-generation tasks.
pub mod ai;

pub use ai::{AiProcessingHandler, AiResultStore, OpenAiTextGenerator, ProviderError, TextGenerator};
pub use email::{EmailHandler, EmailTemplate, HttpMailTransport, MailError, MailTransport, TemplateRegistry};
pub use webhook::WebhookHandler;

/// What a handler knows about the attempt it is executing.
#[derive(Clone, Debug)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: JobType,
    pub tenant_id: TenantId,
    /// 1-based attempt number.
    pub attempt: u16,
    pub max_attempts: u16,
    pub worker_id: String,
    pub lease_id: LeaseId,
}

impl JobContext {
    pub fn from_lease(lease: &JobLease) -> Self {
        Self {
            job_id: lease.job_id(),
            job_type: lease.job_type(),
            tenant_id: lease.tenant_id().clone(),
            attempt: lease.attempt(),
            max_attempts: lease.job.max_attempts,
            worker_id: lease.worker_id.clone(),
            lease_id: lease.lease_id,
        }
    }
}

/// Activity record produced by a successful handler.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerSuccess {
    /// Activity action name, e.g. `email_sent`.
    pub action: String,
    pub metadata: Value,
}

impl HandlerSuccess {
    pub fn new(action: impl Into<String>, metadata: Value) -> Self {
        Self {
            action: action.into(),
            metadata,
        }
    }
}

/// Executes jobs of one type.
///
/// Handlers report every outcome as a value. A handler handed a payload of
/// another type answers with [`JobError::Validation`].
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn handle(&self, ctx: &JobContext, payload: &JobPayload) -> Result<HandlerSuccess, JobError>;
}

pub(crate) fn payload_mismatch(expected: JobType, payload: &JobPayload) -> JobError {
    JobError::Validation(format!(
        "{} handler received a {} payload",
        expected,
        payload.job_type()
    ))
}

/// Dispatches leased jobs to the handler for their type and records the
/// activity of each success.
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    activity: Arc<dyn ActivityLog>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.handlers.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("job_types", &types)
            .finish_non_exhaustive()
    }
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn handler(&self, job_type: JobType) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(&job_type)
    }

    /// Run the handler for `payload` and, on success, write its activity record.
    pub async fn execute(&self, ctx: &JobContext, payload: &JobPayload) -> Result<HandlerSuccess, JobError> {
        payload.validate()?;

        let job_type = payload.job_type();
        let handler = self
            .handlers
            .get(&job_type)
            .ok_or_else(|| JobError::Validation(format!("no handler registered for {job_type}")))?;

        let success = handler.handle(ctx, payload).await?;

        let metadata = with_job_fields(success.metadata.clone(), ctx);
        if let Err(err) = self
            .activity
            .log_activity(&ctx.tenant_id, &success.action, metadata)
            .await
        {
            // The side effect already happened; retrying would repeat it.
            warn!(
                job_id = %ctx.job_id,
                tenant_id = %ctx.tenant_id,
                action = %success.action,
                error = %err,
                "failed to record activity"
            );
        }

        Ok(success)
    }
}

fn with_job_fields(metadata: Value, ctx: &JobContext) -> Value {
    let mut map = match metadata {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            map
        }
    };
    map.insert("jobId".to_string(), json!(ctx.job_id.to_string()));
    map.insert("jobType".to_string(), json!(ctx.job_type.as_str()));
    map.insert("attempt".to_string(), json!(ctx.attempt));
    Value::Object(map)
}

#[async_trait]
impl JobDispatcher for HandlerRegistry {
    async fn dispatch(&self, lease: &JobLease) -> DispatchStatus {
        let ctx = JobContext::from_lease(lease);
        let job_id = ctx.job_id.to_string();
        let result = telemetry::instrument_dispatch(
            &job_id,
            ctx.job_type.as_str(),
            self.execute(&ctx, &lease.job.payload),
        )
        .await;

        match result {
            Ok(_) => DispatchStatus::Success,
            Err(err) => DispatchStatus::from(err),
        }
    }
}

/// Builder for [`HandlerRegistry`].
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    activity: Option<Arc<dyn ActivityLog>>,
}

impl HandlerRegistryBuilder {
    /// Register a handler under the type it reports. A later handler for the
    /// same type replaces the earlier one.
    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.job_type(), handler);
        self
    }

    /// Set the activity sink. Defaults to [`TracingActivityLog`].
    pub fn with_activity_log(mut self, activity: Arc<dyn ActivityLog>) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn build(self) -> anyhow::Result<HandlerRegistry> {
        let missing: Vec<&str> = JobType::ALL
            .iter()
            .filter(|job_type| !self.handlers.contains_key(job_type))
            .map(|job_type| job_type.as_str())
            .collect();
        if !missing.is_empty() {
            anyhow::bail!("missing handlers for job types: {}", missing.join(", "));
        }

        Ok(HandlerRegistry {
            handlers: self.handlers,
            activity: self
                .activity
                .unwrap_or_else(|| Arc::new(TracingActivityLog)),
        })
    }
}
