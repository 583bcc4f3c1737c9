pub mod api;
pub mod cli;
pub mod engine;
pub mod events;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod proxy;
pub mod request;
pub mod router;
pub mod settings;
pub mod store;
pub mod util;

use std::sync::Arc;

use anyhow::Result;

use crate::events::{DecisionLogger, EventSink, TracingEventSink};
use crate::pipeline::Pipeline;
use crate::settings::Settings;
use crate::store::{AuditSink, StoreRegistry, TracingAuditSink};

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let registry = Arc::new(StoreRegistry::open(&settings.data_dir, audit)?);
    // Warm the global snapshot so a broken data dir fails startup, not the
    // first request.
    registry.global().snapshot().await?;

    let events: Arc<dyn EventSink> = Arc::new(TracingEventSink);
    let logger = DecisionLogger::start(events.clone(), settings.event_buffer_capacity);
    let pipeline = Arc::new(Pipeline::new(registry.clone(), logger));

    let api_ctx = api::ApiContext {
        registry,
        events,
    };
    let api_settings = settings.clone();
    tokio::spawn(async move {
        if let Err(err) = api::serve(api_settings, api_ctx).await {
            tracing::error!(error = %err, "admin API listener failed");
        }
    });

    let app = proxy::AppContext::new(settings, pipeline);
    proxy::run(app).await
}
