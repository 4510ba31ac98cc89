//! Producer-facing API for submitting jobs.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{warn, Instrument};

use crate::error::{EnqueueError, ValidationError};
use crate::events::{JobEvent, JobEventPayload, JobEventPublisher};
use crate::handlers::TemplateRegistry;
use crate::job::{AiProcessingPayload, EmailPayload, JobHandle, JobPayload, NewJob, WebhookPayload};
use crate::queue::JobStore;
use crate::telemetry;

/// Submits jobs to a [`JobStore`].
///
/// Every submission is validated before it reaches the store, so a
/// rejected payload never becomes a job. Callers learn only whether the
/// job was accepted; execution outcomes surface through events and the
/// activity log.
pub struct JobClient<S: JobStore + ?Sized> {
    store: Arc<S>,
    events: Arc<dyn JobEventPublisher>,
    templates: Option<Arc<TemplateRegistry>>,
}

impl<S: JobStore + ?Sized> Clone for JobClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            events: Arc::clone(&self.events),
            templates: self.templates.clone(),
        }
    }
}

impl<S: JobStore + ?Sized> fmt::Debug for JobClient<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobClient")
            .field("store_type", &type_name::<S>())
            .field("checks_templates", &self.templates.is_some())
            .finish_non_exhaustive()
    }
}

impl<S: JobStore + ?Sized> JobClient<S> {
    pub fn new(store: Arc<S>, events: Arc<dyn JobEventPublisher>) -> Self {
        Self {
            store,
            events,
            templates: None,
        }
    }

    /// Reject email jobs whose template is not in `templates`.
    pub fn with_templates(mut self, templates: TemplateRegistry) -> Self {
        self.templates = Some(Arc::new(templates));
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Queue an email at the email priority.
    pub async fn add_email_job(&self, payload: EmailPayload) -> Result<JobHandle, EnqueueError> {
        self.enqueue(NewJob::new(JobPayload::Email(payload))).await
    }

    /// Queue a webhook delivery. `payload.retries`, when set, becomes the
    /// attempt budget.
    pub async fn add_webhook_job(&self, payload: WebhookPayload) -> Result<JobHandle, EnqueueError> {
        self.enqueue(NewJob::new(JobPayload::Webhook(payload))).await
    }

    /// Queue an AI task. It becomes available after a short delay so bursts
    /// for the same task land together.
    pub async fn add_ai_processing_job(
        &self,
        payload: AiProcessingPayload,
    ) -> Result<JobHandle, EnqueueError> {
        self.enqueue(NewJob::new(JobPayload::AiProcessing(payload))).await
    }

    /// Queue a job from its wire form, `{"type": "...", "data": {...}}`.
    pub async fn enqueue_json(&self, value: Value) -> Result<JobHandle, EnqueueError> {
        let payload = JobPayload::from_value(value)?;
        self.enqueue(NewJob::new(payload)).await
    }

    /// Validate and store a submission, then announce it.
    pub async fn enqueue(&self, job: NewJob) -> Result<JobHandle, EnqueueError> {
        job.validate()?;
        if let (Some(templates), JobPayload::Email(email)) = (&self.templates, &job.payload) {
            if !templates.contains(&email.template) {
                return Err(ValidationError::UnknownTemplate(email.template.clone()).into());
            }
        }

        let tenant_id = job.payload.tenant_id().clone();
        let job_type = job.job_type();
        let span = telemetry::job_enqueue_span(tenant_id.as_str(), job_type.as_str(), job.priority.value());

        let handle = self
            .store
            .enqueue(job)
            .instrument(span)
            .await
            .map_err(EnqueueError::Store)?;

        telemetry::record_job_enqueued(tenant_id.as_str(), job_type.as_str());

        let event = JobEvent::new(
            tenant_id,
            JobEventPayload::Enqueued {
                job_id: handle.id,
                job_type,
                priority: handle.priority,
                available_at: handle.available_at,
            },
        );
        if let Err(err) = self.events.publish(event).await {
            warn!(job_id = %handle.id, "publish enqueue event failed: {err:#}");
        }

        Ok(handle)
    }
}
