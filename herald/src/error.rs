use thiserror::Error;

use crate::job::JobId;

/// Reasons a payload is rejected before it reaches the job store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("tenant id must not be empty")]
    MissingTenant,

    #[error("field `{field}` must not be empty")]
    EmptyField { field: &'static str },

    #[error("invalid email recipient `{0}`")]
    InvalidRecipient(String),

    #[error("invalid webhook url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid webhook header `{0}`")]
    InvalidHeader(String),

    #[error("max attempts must be at least 1")]
    InvalidMaxAttempts,

    #[error("unknown email template `{0}`")]
    UnknownTemplate(String),

    #[error("unknown job type `{0}`")]
    UnknownJobType(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Outcome taxonomy for a single job execution.
///
/// Handlers return these as values; the worker loop hands them to the
/// retry controller and never lets them escape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Malformed payload. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Network, provider or HTTP 5xx failure. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Explicit rejection by the downstream system. Never retried.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The lease was lost (expired and reaped, or reassigned).
    #[error("lease for job {job_id} expired or was reassigned")]
    LeaseExpired { job_id: JobId },
}

impl JobError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ValidationError> for JobError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Errors surfaced to producers calling the enqueue API.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("job store rejected enqueue: {0:#}")]
    Store(anyhow::Error),
}

impl EnqueueError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(JobError::transient("timeout").is_retryable());
        assert!(!JobError::permanent("410 gone").is_retryable());
        assert!(!JobError::Validation("bad".into()).is_retryable());
        assert!(!JobError::LeaseExpired { job_id: JobId::new() }.is_retryable());
    }

    #[test]
    fn validation_errors_convert_to_job_validation() {
        let err: JobError = ValidationError::MissingTenant.into();
        assert_eq!(err, JobError::Validation("tenant id must not be empty".into()));
    }
}
