use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::lease::LeaseId;

/// Default attempt ceiling for every job type.
pub const DEFAULT_MAX_ATTEMPTS: u16 = 3;

/// Initial delay applied to AI processing jobs so bursts can coalesce.
pub const AI_PROCESSING_DELAY_MS: i64 = 1000;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of the organization that owns a job.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Scheduling priority. Lower values are leased first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPriority(pub i32);

impl JobPriority {
    pub const EMAIL: JobPriority = JobPriority(10);
    pub const WEBHOOK: JobPriority = JobPriority(5);
    pub const AI_PROCESSING: JobPriority = JobPriority(3);

    pub fn value(&self) -> i32 {
        self.0
    }
}

impl Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of job types the subsystem knows how to execute.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Email,
    Webhook,
    AiProcessing,
}

impl JobType {
    pub const ALL: [JobType; 3] = [JobType::Email, JobType::Webhook, JobType::AiProcessing];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Email => "email",
            JobType::Webhook => "webhook",
            JobType::AiProcessing => "ai_processing",
        }
    }

    pub fn default_priority(&self) -> JobPriority {
        match self {
            JobType::Email => JobPriority::EMAIL,
            JobType::Webhook => JobPriority::WEBHOOK,
            JobType::AiProcessing => JobPriority::AI_PROCESSING,
        }
    }

    pub fn default_max_attempts(&self) -> u16 {
        DEFAULT_MAX_ATTEMPTS
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(JobType::Email),
            "webhook" => Ok(JobType::Webhook),
            "ai_processing" => Ok(JobType::AiProcessing),
            other => Err(ValidationError::UnknownJobType(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    /// Part of the persisted state vocabulary, never written by the bundled
    /// stores: a retryable failure goes straight back to `Queued` with a later
    /// `available_at`. Rows carrying it still parse and count as queued.
    Failed,
    DeadLetter,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::DeadLetter => "dead_letter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::DeadLetter)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead_letter" => Ok(JobState::DeadLetter),
            other => Err(anyhow::anyhow!("invalid job state: {}", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailPayload {
    pub to: String,
    pub subject: String,
    pub template: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
    pub tenant_id: TenantId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub url: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u16>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiAction {
    GenerateSuggestions,
    AnalyzeContent,
    AutoCategorize,
}

impl AiAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiAction::GenerateSuggestions => "generate_suggestions",
            AiAction::AnalyzeContent => "analyze_content",
            AiAction::AutoCategorize => "auto_categorize",
        }
    }
}

impl Display for AiAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiProcessingPayload {
    pub task_id: String,
    pub action: AiAction,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub tenant_id: TenantId,
}

/// Type-specific job data. The variant determines which handler runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobPayload {
    Email(EmailPayload),
    Webhook(WebhookPayload),
    AiProcessing(AiProcessingPayload),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Email(_) => JobType::Email,
            JobPayload::Webhook(_) => JobType::Webhook,
            JobPayload::AiProcessing(_) => JobType::AiProcessing,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        match self {
            JobPayload::Email(p) => &p.tenant_id,
            JobPayload::Webhook(p) => &p.tenant_id,
            JobPayload::AiProcessing(p) => &p.tenant_id,
        }
    }

    /// Decode a payload from its wire form, rejecting malformed input as a
    /// validation failure.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let payload: JobPayload = serde_json::from_value(value)
            .map_err(|err| ValidationError::Malformed(err.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tenant_id().is_empty() {
            return Err(ValidationError::MissingTenant);
        }

        match self {
            JobPayload::Email(p) => {
                validate_recipient(&p.to)?;
                require_non_empty("subject", &p.subject)?;
                require_non_empty("template", &p.template)
            }
            JobPayload::Webhook(p) => {
                validate_webhook_url(&p.url)?;
                for (name, value) in &p.headers {
                    HeaderName::from_bytes(name.as_bytes())
                        .map_err(|_| ValidationError::InvalidHeader(name.clone()))?;
                    HeaderValue::from_str(value)
                        .map_err(|_| ValidationError::InvalidHeader(name.clone()))?;
                }
                if p.retries == Some(0) {
                    return Err(ValidationError::InvalidMaxAttempts);
                }
                Ok(())
            }
            JobPayload::AiProcessing(p) => require_non_empty("taskId", &p.task_id),
        }
    }
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::EmptyField { field })
    } else {
        Ok(())
    }
}

fn validate_recipient(to: &str) -> Result<(), ValidationError> {
    require_non_empty("to", to)?;
    let valid = match to.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !to.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidRecipient(to.to_string()))
    }
}

fn validate_webhook_url(raw: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };
    let url = url::Url::parse(raw).map_err(|err| invalid(&err.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(&format!("unsupported scheme `{other}`"))),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(())
}

/// A job submission before it has been assigned an id.
#[derive(Clone, Debug, PartialEq)]
pub struct NewJob {
    pub payload: JobPayload,
    pub priority: JobPriority,
    pub delay: Option<Duration>,
    pub max_attempts: u16,
}

impl NewJob {
    /// Build a submission with the type-specific defaults applied.
    pub fn new(payload: JobPayload) -> Self {
        let job_type = payload.job_type();
        let max_attempts = match &payload {
            JobPayload::Webhook(p) => p.retries.unwrap_or(job_type.default_max_attempts()),
            _ => job_type.default_max_attempts(),
        };
        let delay = match job_type {
            JobType::AiProcessing => Some(Duration::milliseconds(AI_PROCESSING_DELAY_MS)),
            _ => None,
        };
        Self {
            priority: job_type.default_priority(),
            payload,
            delay,
            max_attempts,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn without_delay(mut self) -> Self {
        self.delay = None;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidMaxAttempts);
        }
        self.payload.validate()
    }

    pub fn available_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.delay {
            Some(delay) if delay > Duration::zero() => now + delay,
            _ => now,
        }
    }
}

/// Durable state of a job as held by the job store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: JobPayload,
    pub tenant_id: TenantId,
    pub priority: JobPriority,
    pub available_at: DateTime<Utc>,
    pub attempts: u16,
    pub max_attempts: u16,
    pub state: JobState,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_id: Option<LeaseId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Materialize a submission as a freshly queued record.
    pub fn queued(id: JobId, job: NewJob, now: DateTime<Utc>) -> Self {
        let available_at = job.available_at(now);
        Self {
            id,
            job_type: job.payload.job_type(),
            tenant_id: job.payload.tenant_id().clone(),
            payload: job.payload,
            priority: job.priority,
            available_at,
            attempts: 0,
            max_attempts: job.max_attempts,
            state: JobState::Queued,
            last_error: None,
            lease_owner: None,
            lease_id: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_id = None;
        self.lease_expires_at = None;
    }
}

/// Handle returned to producers once a job has been accepted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub job_type: JobType,
    pub priority: JobPriority,
    pub available_at: DateTime<Utc>,
}

impl From<&JobRecord> for JobHandle {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: record.id,
            job_type: record.job_type,
            priority: record.priority,
            available_at: record.available_at,
        }
    }
}
