use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::request::WafRequest;

/// Terminal state a request ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventAction {
    Block,
    Challenge,
    FinalDeny,
    OriginDispatch,
    OriginMisconfig,
}

impl EventAction {
    pub fn as_str(self) -> &'static str {
        match self {
            EventAction::Block => "BLOCK",
            EventAction::Challenge => "CHALLENGE",
            EventAction::FinalDeny => "FINAL_DENY",
            EventAction::OriginDispatch => "ORIGIN_DISPATCH",
            EventAction::OriginMisconfig => "ORIGIN_MISCONFIG",
        }
    }
}

/// One record per terminated request, shipped to the external event sink.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub action: EventAction,
    pub rule_id: Option<String>,
    /// Evaluation context that terminated the request: `global` or a route id.
    pub context: String,
    pub route_host: Option<String>,
    pub ip: IpAddr,
    pub user_agent: Option<String>,
    pub country: Option<String>,
    pub asn: Option<String>,
    pub colo: Option<String>,
    /// Set when the matched rule's action was LOG; the request was dispatched
    /// as an ALLOW but reporting keeps the distinction.
    pub log_rule: bool,
    pub meta_blob: Value,
    pub headers_blob: Value,
}

impl EventRecord {
    pub fn for_request(
        request: &WafRequest,
        action: EventAction,
        rule_id: Option<String>,
        context: String,
        route_host: Option<String>,
    ) -> Self {
        let headers_blob = Value::Object(
            request
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), Value::String(value.clone())))
                .collect(),
        );
        Self {
            id: Uuid::new_v4().to_string(),
            at: OffsetDateTime::now_utc(),
            action,
            rule_id,
            context,
            route_host,
            ip: request.peer,
            user_agent: request.header("user-agent").map(str::to_string),
            country: request.meta_text("country"),
            asn: request.meta_text("asn"),
            colo: request.meta_text("colo"),
            log_rule: false,
            meta_blob: Value::Object(request.meta.clone()),
            headers_blob,
        }
    }

    pub fn with_log_rule(mut self) -> Self {
        self.log_rule = true;
        self
    }
}

/// Append-only destination for decision events. Aggregation runs on the
/// host-driven periodic tick, not in the request path.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, record: EventRecord) -> Result<()>;
    /// Overflow notice: `count` events were dropped since the last notice.
    async fn note_dropped(&self, count: u64) -> Result<()>;
    async fn aggregate(&self) -> Result<()>;
}

/// Default sink: structured records on the `event_log` tracing target.
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn append(&self, record: EventRecord) -> Result<()> {
        let payload = serde_json::to_string(&record)?;
        tracing::info!(
            target: "event_log",
            action = record.action.as_str(),
            context = %record.context,
            rule_id = record.rule_id.as_deref().unwrap_or_default(),
            record = %payload,
            "request decision"
        );
        Ok(())
    }

    async fn note_dropped(&self, count: u64) -> Result<()> {
        warn!(target: "event_log", dropped = count, "decision events dropped on overflow");
        Ok(())
    }

    async fn aggregate(&self) -> Result<()> {
        debug!(target: "event_log", "aggregation tick");
        Ok(())
    }
}

/// Fire-and-forget decision logger: the request path pushes into a bounded
/// ring and returns; a background task drains into the sink. Overflow drops
/// the oldest record and counts the loss.
#[derive(Clone)]
pub struct DecisionLogger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    queue: Mutex<VecDeque<EventRecord>>,
    notify: Notify,
    dropped: AtomicU64,
    capacity: usize,
}

impl DecisionLogger {
    pub fn start(sink: Arc<dyn EventSink>, capacity: usize) -> Self {
        let inner = Arc::new(LoggerInner {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            capacity: capacity.max(1),
        });
        let drain = inner.clone();
        tokio::spawn(async move {
            loop {
                drain.notify.notified().await;
                loop {
                    let record = drain.queue.lock().pop_front();
                    let Some(record) = record else { break };
                    if let Err(err) = sink.append(record).await {
                        warn!(error = %err, "event sink append failed");
                    }
                }
                let dropped = drain.dropped.swap(0, Ordering::Relaxed);
                if dropped > 0 {
                    crate::metrics::record_events_dropped(dropped);
                    if let Err(err) = sink.note_dropped(dropped).await {
                        warn!(error = %err, "event sink drop notice failed");
                    }
                }
            }
        });
        Self { inner }
    }

    /// Never blocks and never fails; the hot path must not couple its
    /// latency to the sink.
    pub fn emit(&self, record: EventRecord) {
        crate::metrics::record_decision(record.action.as_str(), &record.context);
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(record);
        }
        self.inner.notify.notify_one();
    }
}
