use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::debug;

use super::{payload_mismatch, HandlerSuccess, JobContext, JobHandler};
use crate::config::WebhookConfig;
use crate::error::JobError;
use crate::job::{JobPayload, JobType};

type HmacSha256 = Hmac<Sha256>;

pub const SECRET_HEADER: &str = "x-webhook-secret";
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const JOB_ID_HEADER: &str = "x-webhook-job-id";
pub const ATTEMPT_HEADER: &str = "x-webhook-attempt";

/// HMAC-SHA256 of `body`, formatted as `sha256=<hex>`.
pub fn sign_payload(key: &str, body: &[u8]) -> Result<String, JobError> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|err| JobError::permanent(format!("invalid signing key: {err}")))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Map a response status onto the job outcome.
///
/// 2xx succeeds. 408, 429 and 5xx are worth retrying; any other status is
/// the receiver rejecting the delivery.
pub fn classify_status(status: StatusCode) -> Result<(), JobError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Err(JobError::transient(format!("webhook responded {status}")))
    } else {
        Err(JobError::permanent(format!("webhook responded {status}")))
    }
}

/// Delivers webhook jobs as JSON POST requests.
#[derive(Clone, Debug)]
pub struct WebhookHandler {
    client: reqwest::Client,
    secret: Option<String>,
    signing_key: Option<String>,
}

impl WebhookHandler {
    pub fn new(config: &WebhookConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            secret: config.secret.clone(),
            signing_key: config.signing_key.clone(),
        })
    }

    fn headers(&self, ctx: &JobContext, caller: &std::collections::HashMap<String, String>, body: &[u8]) -> Result<HeaderMap, JobError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("herald-webhooks/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(JOB_ID_HEADER, header_value(&ctx.job_id.to_string())?);
        headers.insert(ATTEMPT_HEADER, HeaderValue::from(ctx.attempt));
        if let Some(secret) = &self.secret {
            headers.insert(SECRET_HEADER, header_value(secret)?);
        }

        // Caller headers win over the defaults above.
        for (name, value) in caller {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| JobError::Validation(format!("invalid webhook header `{name}`")))?;
            headers.insert(name, header_value(value)?);
        }

        if let Some(key) = &self.signing_key {
            headers.insert(SIGNATURE_HEADER, header_value(&sign_payload(key, body)?)?);
        }
        Ok(headers)
    }
}

fn header_value(raw: &str) -> Result<HeaderValue, JobError> {
    HeaderValue::from_str(raw).map_err(|_| JobError::Validation("invalid webhook header value".into()))
}

#[async_trait]
impl JobHandler for WebhookHandler {
    fn job_type(&self) -> JobType {
        JobType::Webhook
    }

    async fn handle(&self, ctx: &JobContext, payload: &JobPayload) -> Result<HandlerSuccess, JobError> {
        let JobPayload::Webhook(hook) = payload else {
            return Err(payload_mismatch(JobType::Webhook, payload));
        };

        let body = serde_json::to_vec(&Value::Object(hook.payload.clone()))
            .map_err(|err| JobError::Validation(err.to_string()))?;
        let headers = self.headers(ctx, &hook.headers, &body)?;

        let response = self
            .client
            .post(&hook.url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    JobError::transient(format!("webhook timed out: {err}"))
                } else {
                    JobError::transient(format!("webhook request failed: {err}"))
                }
            })?;

        let status = response.status();
        classify_status(status)?;

        debug!(job_id = %ctx.job_id, status = status.as_u16(), "webhook delivered");

        Ok(HandlerSuccess::new(
            "webhook_delivered",
            json!({
                "url": hook.url,
                "status": status.as_u16(),
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, TenantId};
    use crate::lease::LeaseId;
    use std::collections::HashMap;

    fn ctx() -> JobContext {
        JobContext {
            job_id: JobId::new(),
            job_type: JobType::Webhook,
            tenant_id: TenantId::from("acme"),
            attempt: 2,
            max_attempts: 3,
            worker_id: "w".into(),
            lease_id: LeaseId::new(),
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::OK).is_ok());
        assert!(classify_status(StatusCode::NO_CONTENT).is_ok());
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR).unwrap_err().is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY).unwrap_err().is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS).unwrap_err().is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT).unwrap_err().is_retryable());
        assert!(matches!(classify_status(StatusCode::NOT_FOUND), Err(JobError::Permanent(_))));
        assert!(matches!(classify_status(StatusCode::GONE), Err(JobError::Permanent(_))));
    }

    #[test]
    fn test_signature_is_stable_hex_hmac() {
        // RFC 4231 test case 2.
        let sig = sign_payload("Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_headers_merge_caller_values_and_sign_last() {
        let handler = WebhookHandler::new(&WebhookConfig {
            timeout_ms: 0,
            secret: Some("configured".into()),
            signing_key: Some("k".into()),
        })
        .unwrap();

        let mut caller = HashMap::new();
        caller.insert("X-Webhook-Secret".to_string(), "from-caller".to_string());
        caller.insert("X-Trace".to_string(), "abc".to_string());
        caller.insert("X-Webhook-Signature".to_string(), "forged".to_string());

        let ctx = ctx();
        let headers = handler.headers(&ctx, &caller, b"{}").unwrap();
        assert_eq!(headers[SECRET_HEADER], "from-caller");
        assert_eq!(headers["x-trace"], "abc");
        assert_eq!(headers[ATTEMPT_HEADER], "2");
        assert_eq!(headers[JOB_ID_HEADER], ctx.job_id.to_string().as_str());
        assert_eq!(headers[SIGNATURE_HEADER], sign_payload("k", b"{}").unwrap().as_str());
    }
}
