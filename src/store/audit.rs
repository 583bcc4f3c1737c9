use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

/// One configuration change, captured after its transaction committed.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub actor: String,
    /// Owning tenant: `global` or a route id.
    pub context: String,
    /// Dotted verb, e.g. `rule.create`, `route.delete`.
    pub action: String,
    pub target_id: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl AuditRecord {
    pub fn new(
        actor: &str,
        context: String,
        action: &str,
        target_id: &str,
        before: Option<Value>,
        after: Option<Value>,
    ) -> Self {
        Self {
            actor: actor.to_string(),
            context,
            action: action.to_string(),
            target_id: target_id.to_string(),
            before,
            after,
            at: OffsetDateTime::now_utc(),
        }
    }
}

/// Append-only audit destination. Retry discipline belongs to the sink; the
/// store only logs emission failures.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: AuditRecord) -> Result<()>;
}

/// Default sink: structured record on the `audit_log` tracing target.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        let payload = serde_json::to_string(&record)?;
        tracing::info!(
            target: "audit_log",
            actor = %record.actor,
            context = %record.context,
            action = %record.action,
            target_id = %record.target_id,
            record = %payload,
            "configuration change"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Captures records for assertions instead of logging them.
    #[derive(Default)]
    pub struct RecordingAuditSink {
        pub records: Arc<Mutex<Vec<AuditRecord>>>,
    }

    #[async_trait]
    impl AuditSink for RecordingAuditSink {
        async fn append(&self, record: AuditRecord) -> Result<()> {
            self.records.lock().push(record);
            Ok(())
        }
    }
}
