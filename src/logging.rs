use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use http::StatusCode;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// One line per terminated data-plane request on the `access_log` target.
#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub client_ip: std::net::IpAddr,
    pub client_port: u16,
    pub method: String,
    pub host: String,
    pub path: String,
    pub status: u16,
    pub decision: String,
    pub rule: Option<String>,
    pub context: Option<String>,
    pub bytes_out: u64,
    pub elapsed_ms: u128,
}

#[derive(Debug)]
pub struct AccessLogBuilder {
    event: AccessLogEvent,
}

impl AccessLogBuilder {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            event: AccessLogEvent {
                client_ip: peer.ip(),
                client_port: peer.port(),
                method: String::new(),
                host: String::new(),
                path: String::new(),
                status: 0,
                decision: String::from("UNKNOWN"),
                rule: None,
                context: None,
                bytes_out: 0,
                elapsed_ms: 0,
            },
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.event.method = method.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.event.host = host.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.event.path = path.into();
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = status.as_u16();
        self
    }

    pub fn status_u16(mut self, status: u16) -> Self {
        self.event.status = status;
        self
    }

    pub fn decision(mut self, decision: impl Into<String>) -> Self {
        self.event.decision = decision.into();
        self
    }

    pub fn rule(mut self, rule: impl Into<String>) -> Self {
        self.event.rule = Some(rule.into());
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.event.context = Some(context.into());
        self
    }

    pub fn bytes_out(mut self, bytes: u64) -> Self {
        self.event.bytes_out = bytes;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn build(self) -> AccessLogEvent {
        self.event
    }

    pub fn log(self) {
        log_access(self.build());
    }
}

pub fn log_access(event: AccessLogEvent) {
    let AccessLogEvent {
        client_ip,
        client_port,
        method,
        host,
        path,
        status,
        decision,
        rule,
        context,
        bytes_out,
        elapsed_ms,
    } = event;

    tracing::info!(
        target = "access_log",
        client_ip = %client_ip,
        client_port,
        method,
        host,
        path,
        status,
        decision,
        rule = rule.as_deref().unwrap_or_default(),
        context = context.as_deref().unwrap_or_default(),
        bytes_out,
        elapsed_ms,
        "request terminated"
    );
}
