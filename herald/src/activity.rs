use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::job::TenantId;

/// Append-only, tenant-scoped audit sink written after each successful job.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn log_activity(
        &self,
        tenant_id: &TenantId,
        action: &str,
        metadata: Value,
    ) -> anyhow::Result<()>;
}

/// Activity log that emits each record as a structured `tracing` event.
///
/// Used when no durable store is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActivityLog;

#[async_trait]
impl ActivityLog for TracingActivityLog {
    async fn log_activity(
        &self,
        tenant_id: &TenantId,
        action: &str,
        metadata: Value,
    ) -> anyhow::Result<()> {
        info!(
            target: "herald::activity",
            tenant_id = %tenant_id,
            action,
            metadata = %metadata,
            "activity"
        );
        Ok(())
    }
}
