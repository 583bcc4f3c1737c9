use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;
use tokio::net::TcpListener;

use hostguard::api::{self, ApiContext};
use hostguard::cli::LogFormat;
use hostguard::events::{DecisionLogger, EventSink, TracingEventSink};
use hostguard::pipeline::Pipeline;
use hostguard::proxy::{self, AppContext};
use hostguard::settings::Settings;
use hostguard::store::{AuditSink, StoreRegistry, TracingAuditSink};

/// A fully wired firewall on ephemeral ports, stores on a temp dir.
pub struct WafHarness {
    pub data_addr: SocketAddr,
    pub api_addr: SocketAddr,
    pub registry: Arc<StoreRegistry>,
    pub data_dir: PathBuf,
    _dir: TempDir,
}

pub async fn spawn_waf(service_bindings: HashMap<String, String>) -> Result<WafHarness> {
    let dir = TempDir::new()?;
    let settings = Arc::new(test_settings(dir.path().to_path_buf(), service_bindings));

    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let registry = Arc::new(StoreRegistry::open(&settings.data_dir, audit)?);
    registry.global().snapshot().await?;

    let events: Arc<dyn EventSink> = Arc::new(TracingEventSink);
    let logger = DecisionLogger::start(events.clone(), settings.event_buffer_capacity);
    let pipeline = Arc::new(Pipeline::new(registry.clone(), logger));

    let data_listener = TcpListener::bind("127.0.0.1:0").await?;
    let data_addr = data_listener.local_addr()?;
    let api_listener = TcpListener::bind("127.0.0.1:0").await?;
    let api_addr = api_listener.local_addr()?;

    let api_ctx = ApiContext {
        registry: registry.clone(),
        events,
    };
    let api_settings = settings.clone();
    tokio::spawn(async move {
        let _ = api::serve_on(api_listener, api_settings, api_ctx).await;
    });

    let app = AppContext::new(settings, pipeline);
    tokio::spawn(async move {
        let _ = proxy::listener::serve_on(data_listener, app).await;
    });

    Ok(WafHarness {
        data_addr,
        api_addr,
        registry,
        data_dir: dir.path().to_path_buf(),
        _dir: dir,
    })
}

fn test_settings(data_dir: PathBuf, service_bindings: HashMap<String, String>) -> Settings {
    Settings {
        listen: "127.0.0.1:0".parse().unwrap(),
        api_listen: "127.0.0.1:0".parse().unwrap(),
        metrics_listen: None,
        data_dir,
        log: LogFormat::Text,
        client_timeout: 5,
        request_timeout: 5,
        upstream_connect_timeout: 2,
        upstream_timeout: 5,
        max_header_size: 32 * 1024,
        max_response_header_size: 32 * 1024,
        event_buffer_capacity: 256,
        service_bindings,
    }
}
