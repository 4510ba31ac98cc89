use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use herald::runtime::{DispatchStatus, JobDispatcher};
use herald::*;
use parking_lot::Mutex;
use serde_json::Value;

/// Dispatcher that records every lease and answers from a script.
///
/// Scripted statuses are consumed in order; once the script is empty every
/// dispatch returns the fallback result.
#[derive(Clone)]
pub struct MockDispatcher {
    dispatches: Arc<Mutex<Vec<DispatchRecord>>>,
    script: Arc<Mutex<VecDeque<DispatchStatus>>>,
    result: Arc<Mutex<DispatchStatus>>,
    delay: Duration,
}

#[derive(Clone, Debug)]
pub struct DispatchRecord {
    pub lease_id: LeaseId,
    pub job_id: JobId,
    pub job_type: JobType,
    pub tenant_id: TenantId,
    pub attempt: u16,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::with_result(DispatchStatus::Success)
    }

    pub fn with_result(result: DispatchStatus) -> Self {
        Self {
            dispatches: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            result: Arc::new(Mutex::new(result)),
            delay: Duration::ZERO,
        }
    }

    /// Answer with `statuses` first, then succeed.
    pub fn with_script(statuses: impl IntoIterator<Item = DispatchStatus>) -> Self {
        let mock = Self::new();
        mock.script.lock().extend(statuses);
        mock
    }

    /// Sleep this long inside every dispatch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn record(&self) -> Vec<DispatchRecord> {
        self.dispatches.lock().clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatches.lock().len()
    }

    pub fn assert_dispatch_count_eq(&self, expected: usize) {
        let actual = self.dispatch_count();
        assert_eq!(actual, expected, "Expected {expected} dispatches, got {actual}");
    }

}

impl Default for MockDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobDispatcher for MockDispatcher {
    async fn dispatch(&self, lease: &JobLease) -> DispatchStatus {
        self.dispatches.lock().push(DispatchRecord {
            lease_id: lease.lease_id,
            job_id: lease.job_id(),
            job_type: lease.job_type(),
            tenant_id: lease.tenant_id().clone(),
            attempt: lease.attempt(),
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.result.lock().clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Mail transport that keeps every message in memory.
#[derive(Default)]
pub struct RecordingMailTransport {
    sent: Mutex<Vec<SentMail>>,
    failures: Mutex<VecDeque<MailError>>,
}

impl RecordingMailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next sends with these errors, in order.
    pub fn failing_with(errors: impl IntoIterator<Item = MailError>) -> Self {
        let transport = Self::default();
        transport.failures.lock().extend(errors);
        transport
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl MailTransport for RecordingMailTransport {
    async fn send(&self, to: &str, subject: &str, html_body: &str, text_body: &str) -> Result<(), MailError> {
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        self.sent.lock().push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            html: html_body.to_string(),
            text: text_body.to_string(),
        });
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationCall {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Text generator answering from a script of results, then a fixed reply.
pub struct ScriptedTextGenerator {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: String,
    calls: Mutex<Vec<GenerationCall>>,
}

impl ScriptedTextGenerator {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, result: Result<String, ProviderError>) -> Self {
        self.script.lock().push_back(result);
        self
    }

    pub fn calls(&self) -> Vec<GenerationCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedTextGenerator {
    async fn generate(&self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<String, ProviderError> {
        self.calls.lock().push(GenerationCall {
            prompt: prompt.to_string(),
            temperature,
            max_tokens,
        });
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredAiResult {
    pub tenant_id: TenantId,
    pub task_id: String,
    pub action: AiAction,
    pub result: Value,
}

#[derive(Default)]
pub struct InMemoryAiResultStore {
    results: Mutex<Vec<StoredAiResult>>,
}

impl InMemoryAiResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<StoredAiResult> {
        self.results.lock().clone()
    }
}

#[async_trait]
impl AiResultStore for InMemoryAiResultStore {
    async fn store_ai_result(
        &self,
        tenant_id: &TenantId,
        task_id: &str,
        action: AiAction,
        result: Value,
    ) -> anyhow::Result<()> {
        self.results.lock().push(StoredAiResult {
            tenant_id: tenant_id.clone(),
            task_id: task_id.to_string(),
            action,
            result,
        });
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ActivityEntry {
    pub tenant_id: TenantId,
    pub action: String,
    pub metadata: Value,
}

#[derive(Default)]
pub struct RecordingActivityLog {
    entries: Mutex<Vec<ActivityEntry>>,
}

impl RecordingActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.lock().clone()
    }

    /// Entries whose action is `action`.
    pub fn entries_for(&self, action: &str) -> Vec<ActivityEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.action == action)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ActivityLog for RecordingActivityLog {
    async fn log_activity(&self, tenant_id: &TenantId, action: &str, metadata: Value) -> anyhow::Result<()> {
        self.entries.lock().push(ActivityEntry {
            tenant_id: tenant_id.clone(),
            action: action.to_string(),
            metadata,
        });
        Ok(())
    }
}

/// A complete handler registry backed by the recording fakes.
pub struct FakeHandlers {
    pub mail: Arc<RecordingMailTransport>,
    pub generator: Arc<ScriptedTextGenerator>,
    pub results: Arc<InMemoryAiResultStore>,
    pub activity: Arc<RecordingActivityLog>,
    pub registry: Arc<HandlerRegistry>,
}

impl FakeHandlers {
    /// Build a registry whose webhook handler uses `webhook` config and whose
    /// AI handler answers from `generator`.
    pub fn build(webhook: &WebhookConfig, generator: ScriptedTextGenerator) -> anyhow::Result<Self> {
        Self::build_with_mail(webhook, generator, RecordingMailTransport::new())
    }

    /// Like [`build`](Self::build), delivering email through `mail`.
    pub fn build_with_mail(
        webhook: &WebhookConfig,
        generator: ScriptedTextGenerator,
        mail: RecordingMailTransport,
    ) -> anyhow::Result<Self> {
        let mail = Arc::new(mail);
        let generator = Arc::new(generator);
        let results = Arc::new(InMemoryAiResultStore::new());
        let activity = Arc::new(RecordingActivityLog::new());

        let registry = HandlerRegistry::builder()
            .with_handler(Arc::new(EmailHandler::new(
                TemplateRegistry::with_defaults(),
                mail.clone(),
            )))
            .with_handler(Arc::new(WebhookHandler::new(webhook)?))
            .with_handler(Arc::new(AiProcessingHandler::new(
                generator.clone(),
                results.clone(),
            )))
            .with_activity_log(activity.clone())
            .build()?;

        Ok(Self {
            mail,
            generator,
            results,
            activity,
            registry: Arc::new(registry),
        })
    }
}
