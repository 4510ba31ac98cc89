use std::collections::HashMap;

use herald::{
    AiAction, AiProcessingPayload, EmailPayload, JobPayload, NewJob, TenantId, WebhookPayload,
};
use serde_json::{json, Map, Value};

pub const TEST_TENANT: &str = "tenant-test";

pub fn tenant() -> TenantId {
    TenantId::from(TEST_TENANT)
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// A welcome email to `to` for the test tenant.
pub fn email_payload(to: &str) -> EmailPayload {
    EmailPayload {
        to: to.to_string(),
        subject: "Welcome to the team".to_string(),
        template: "welcome".to_string(),
        variables: object(json!({ "name": "Ada", "workspace": "Acme" })),
        tenant_id: tenant(),
    }
}

/// A `task.created` webhook to `url` for the test tenant.
pub fn webhook_payload(url: &str) -> WebhookPayload {
    WebhookPayload {
        url: url.to_string(),
        payload: object(json!({ "event": "task.created", "taskId": "task-1" })),
        headers: HashMap::new(),
        tenant_id: tenant(),
        retries: None,
    }
}

pub fn ai_payload(task_id: &str, action: AiAction) -> AiProcessingPayload {
    AiProcessingPayload {
        task_id: task_id.to_string(),
        action,
        context: object(json!({
            "title": "Fix login redirect",
            "description": "Users land on a blank page after signing in",
        })),
        tenant_id: tenant(),
    }
}

pub fn email_job(to: &str) -> NewJob {
    NewJob::new(JobPayload::Email(email_payload(to)))
}

pub fn webhook_job(url: &str) -> NewJob {
    NewJob::new(JobPayload::Webhook(webhook_payload(url)))
}

/// An AI job with the batching delay removed so it is ready immediately.
pub fn ai_job(task_id: &str, action: AiAction) -> NewJob {
    NewJob::new(JobPayload::AiProcessing(ai_payload(task_id, action))).without_delay()
}
