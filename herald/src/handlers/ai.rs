use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::{payload_mismatch, HandlerSuccess, JobContext, JobHandler};
use crate::config::AiConfig;
use crate::error::JobError;
use crate::job::{AiAction, JobPayload, JobType, TenantId};

/// Text-generation provider errors. Every variant is retryable.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("provider responded {status}: {body}")]
    Api { status: u16, body: String },

    #[error("unexpected provider response: {0}")]
    Parse(String),
}

/// Text-generation provider.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<String, ProviderError>;
}

/// Writes generated results back into tenant-scoped task state.
#[async_trait]
pub trait AiResultStore: Send + Sync {
    /// Merge `result` into the task's suggestion map under `action`.
    async fn store_ai_result(
        &self,
        tenant_id: &TenantId,
        task_id: &str,
        action: AiAction,
        result: Value,
    ) -> anyhow::Result<()>;
}

/// Prompt plus sampling parameters for one AI action.
#[derive(Clone, Debug, PartialEq)]
pub struct PromptSpec {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

fn context_field<'a>(context: &'a Map<String, Value>, key: &str) -> &'a str {
    context.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Build the provider prompt for `action` from the task context.
pub fn build_prompt(action: AiAction, context: &Map<String, Value>) -> PromptSpec {
    let title = context_field(context, "title");
    let description = context_field(context, "description");
    let context_json = Value::Object(context.clone()).to_string();

    match action {
        AiAction::GenerateSuggestions => PromptSpec {
            prompt: format!(
                "You are a project management assistant. Suggest up to five concrete next steps \
                 for the task below. Reply with one suggestion per line.\n\n\
                 Title: {title}\nDescription: {description}\nContext: {context_json}"
            ),
            temperature: 0.7,
            max_tokens: 500,
        },
        AiAction::AnalyzeContent => PromptSpec {
            prompt: format!(
                "Analyze the following task. Summarize it in two sentences, list any risks or \
                 blockers, and estimate its complexity as low, medium or high.\n\n\
                 Title: {title}\nDescription: {description}\nContext: {context_json}"
            ),
            temperature: 0.3,
            max_tokens: 800,
        },
        AiAction::AutoCategorize => {
            let categories = context
                .get("categories")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .filter(|joined| !joined.is_empty())
                .unwrap_or_else(|| "bug, feature, improvement, documentation, research".to_string());
            PromptSpec {
                prompt: format!(
                    "Pick the single best category for this task from: {categories}. \
                     Reply with the category name only.\n\n\
                     Title: {title}\nDescription: {description}"
                ),
                temperature: 0.2,
                max_tokens: 50,
            }
        }
    }
}

/// Chat-completions client for OpenAI-compatible providers.
#[derive(Clone, Debug)]
pub struct OpenAiTextGenerator {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatResponseRaw {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl OpenAiTextGenerator {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: model.into(),
        })
    }

    /// Set a custom base URL (for Azure, proxies, etc.).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn from_config(config: &AiConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        Ok(Self::new(api_key, config.model.clone(), Duration::from_millis(config.timeout_ms))?
            .with_base_url(config.base_url.clone()))
    }
}

#[async_trait]
impl TextGenerator for OpenAiTextGenerator {
    async fn generate(&self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<String, ProviderError> {
        let start = std::time::Instant::now();

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
                "temperature": temperature,
                "max_tokens": max_tokens,
            }))
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "text generation request failed");
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %body, "text generation API error");
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let raw: ChatResponseRaw = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let content = raw
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Parse("no choices in response".into()))?;

        debug!(
            model = %self.model,
            duration_ms = start.elapsed().as_millis() as u64,
            "text generation completed"
        );
        Ok(content)
    }
}

/// Runs AI processing jobs: prompt, generate, store.
pub struct AiProcessingHandler {
    generator: Arc<dyn TextGenerator>,
    results: Arc<dyn AiResultStore>,
}

impl AiProcessingHandler {
    pub fn new(generator: Arc<dyn TextGenerator>, results: Arc<dyn AiResultStore>) -> Self {
        Self { generator, results }
    }
}

/// Keep structured provider output structured; anything else is stored as text.
fn result_value(text: &str) -> Value {
    let trimmed = text.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => value,
        _ => Value::String(trimmed.to_string()),
    }
}

#[async_trait]
impl JobHandler for AiProcessingHandler {
    fn job_type(&self) -> JobType {
        JobType::AiProcessing
    }

    async fn handle(&self, ctx: &JobContext, payload: &JobPayload) -> Result<HandlerSuccess, JobError> {
        let JobPayload::AiProcessing(task) = payload else {
            return Err(payload_mismatch(JobType::AiProcessing, payload));
        };

        let spec = build_prompt(task.action, &task.context);
        let text = self
            .generator
            .generate(&spec.prompt, spec.temperature, spec.max_tokens)
            .await
            .map_err(|err| JobError::transient(err.to_string()))?;

        self.results
            .store_ai_result(&task.tenant_id, &task.task_id, task.action, result_value(&text))
            .await
            .map_err(|err| JobError::transient(format!("failed to store AI result: {err:#}")))?;

        debug!(job_id = %ctx.job_id, task_id = %task.task_id, action = %task.action, "AI result stored");

        Ok(HandlerSuccess::new(
            "ai_processed",
            json!({
                "taskId": task.task_id,
                "action": task.action.as_str(),
            }),
        ))
    }
}
