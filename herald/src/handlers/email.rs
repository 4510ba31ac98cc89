use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use super::{payload_mismatch, HandlerSuccess, JobContext, JobHandler};
use crate::config::MailConfig;
use crate::error::JobError;
use crate::job::{JobPayload, JobType};

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail transport error: {0}")]
    Transport(String),

    #[error("mail provider responded {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Outbound mail delivery.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str, text_body: &str) -> Result<(), MailError>;
}

/// A named email body with `{{variable}}` placeholders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailTemplate {
    pub html: String,
    pub text: String,
}

impl EmailTemplate {
    pub fn new(html: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            text: text.into(),
        }
    }
}

/// Rendered message ready for the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Lookup table of email templates by name.
#[derive(Clone, Debug, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, EmailTemplate>,
}

impl TemplateRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in templates.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.insert(
            "welcome",
            EmailTemplate::new(
                "<h1>Welcome to {{organizationName}}, {{name}}!</h1>\
                 <p>Your workspace is ready. <a href=\"{{loginUrl}}\">Sign in</a> to get started.</p>",
                "Welcome to {{organizationName}}, {{name}}!\n\nYour workspace is ready. Sign in at {{loginUrl}} to get started.",
            ),
        );
        registry.insert(
            "task_assigned",
            EmailTemplate::new(
                "<p>{{assignerName}} assigned you <strong>{{taskTitle}}</strong> in {{projectName}}.</p>\
                 <p><a href=\"{{taskUrl}}\">Open the task</a></p>",
                "{{assignerName}} assigned you \"{{taskTitle}}\" in {{projectName}}.\n\nOpen the task: {{taskUrl}}",
            ),
        );
        registry.insert(
            "project_invitation",
            EmailTemplate::new(
                "<p>{{inviterName}} invited you to join <strong>{{projectName}}</strong>.</p>\
                 <p><a href=\"{{inviteUrl}}\">Accept the invitation</a></p>",
                "{{inviterName}} invited you to join {{projectName}}.\n\nAccept the invitation: {{inviteUrl}}",
            ),
        );
        registry.insert(
            "password_reset",
            EmailTemplate::new(
                "<p>Hi {{name}},</p><p>Use the link below to reset your password. It expires in {{expiresIn}}.</p>\
                 <p><a href=\"{{resetUrl}}\">Reset password</a></p>",
                "Hi {{name}},\n\nUse this link to reset your password. It expires in {{expiresIn}}.\n\n{{resetUrl}}",
            ),
        );
        registry.insert(
            "notification",
            EmailTemplate::new("<p>{{message}}</p>", "{{message}}"),
        );
        registry
    }

    pub fn insert(&mut self, name: impl Into<String>, template: EmailTemplate) {
        self.templates.insert(name.into(), template);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&EmailTemplate> {
        self.templates.get(name)
    }

    /// Render `name` with `variables`. Returns `None` for an unknown template.
    pub fn render(&self, name: &str, subject: &str, variables: &Map<String, Value>) -> Option<RenderedEmail> {
        let template = self.get(name)?;
        Some(RenderedEmail {
            subject: substitute(subject, variables, false),
            html: substitute(&template.html, variables, true),
            text: substitute(&template.text, variables, false),
        })
    }
}

/// Replace `{{ key }}` placeholders. Missing keys render as empty strings.
pub fn substitute(template: &str, variables: &Map<String, Value>, escape: bool) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                let value = variables.get(key).map(display_value).unwrap_or_default();
                if escape {
                    out.push_str(&escape_html(&value));
                } else {
                    out.push_str(&value);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Mail transport posting JSON to an HTTP mail API.
#[derive(Clone, Debug)]
pub struct HttpMailTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    from: String,
}

impl HttpMailTransport {
    pub fn new(endpoint: impl Into<String>, from: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: None,
            from: from.into(),
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn from_config(config: &MailConfig) -> anyhow::Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("HERALD_MAIL_ENDPOINT is not configured"))?;
        let transport = Self::new(endpoint, config.from.clone(), Duration::from_millis(config.timeout_ms))?;
        Ok(match &config.api_key {
            Some(key) => transport.with_api_key(key.clone()),
            None => transport,
        })
    }
}

#[async_trait]
impl MailTransport for HttpMailTransport {
    async fn send(&self, to: &str, subject: &str, html_body: &str, text_body: &str) -> Result<(), MailError> {
        let mut request = self.client.post(&self.endpoint).json(&json!({
            "from": self.from,
            "to": to,
            "subject": subject,
            "html": html_body,
            "text": text_body,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| MailError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(MailError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Renders a template and hands the message to the mail transport.
///
/// Every failure is retryable. Unknown templates are normally rejected at
/// enqueue by a [`JobClient`](crate::JobClient) that knows the registry; one
/// that slips through is retried in case the registry is being redeployed.
pub struct EmailHandler {
    templates: TemplateRegistry,
    transport: Arc<dyn MailTransport>,
}

impl EmailHandler {
    pub fn new(templates: TemplateRegistry, transport: Arc<dyn MailTransport>) -> Self {
        Self { templates, transport }
    }
}

#[async_trait]
impl JobHandler for EmailHandler {
    fn job_type(&self) -> JobType {
        JobType::Email
    }

    async fn handle(&self, ctx: &JobContext, payload: &JobPayload) -> Result<HandlerSuccess, JobError> {
        let JobPayload::Email(email) = payload else {
            return Err(payload_mismatch(JobType::Email, payload));
        };

        let rendered = self
            .templates
            .render(&email.template, &email.subject, &email.variables)
            .ok_or_else(|| JobError::transient(format!("unknown email template `{}`", email.template)))?;

        self.transport
            .send(&email.to, &rendered.subject, &rendered.html, &rendered.text)
            .await
            .map_err(|err| JobError::transient(err.to_string()))?;

        debug!(job_id = %ctx.job_id, template = %email.template, "email sent");

        Ok(HandlerSuccess::new(
            "email_sent",
            json!({
                "to": email.to,
                "subject": rendered.subject,
                "template": email.template,
            }),
        ))
    }
}
