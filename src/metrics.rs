use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    time::timeout,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static DECISIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("decisions_total", "Terminal decisions by action and context");
    let vec = IntCounterVec::new(opts, &["action", "context"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register decisions_total");
    vec
});

static RULE_HITS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("rule_hits_total", "Rule match counter by tenant");
    let vec = IntCounterVec::new(opts, &["context", "rule"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register rule_hits_total");
    vec
});

static EVENTS_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "events_dropped_total",
        "Decision events dropped on buffer overflow",
    )
    .expect("create events_dropped_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register events_dropped_total");
    counter
});

static UPSTREAM_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("upstream_errors_total", "Origin dispatch failures by kind");
    let vec = IntCounterVec::new(opts, &["kind"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register upstream_errors_total");
    vec
});

pub fn record_decision(action: &str, context: &str) {
    DECISIONS_TOTAL.with_label_values(&[action, context]).inc();
}

pub fn record_rule_hit(context: &str, rule: &str) {
    RULE_HITS_TOTAL.with_label_values(&[context, rule]).inc();
}

pub fn record_events_dropped(count: u64) {
    EVENTS_DROPPED_TOTAL.inc_by(count);
}

pub fn record_upstream_error(kind: &str) {
    UPSTREAM_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn gather() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("metrics output was not UTF-8")
}

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimal plaintext exposition endpoint, one short-lived connection per
/// scrape.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::debug!(error = %err, "metrics accept failed");
                continue;
            }
        };
        tokio::spawn(async move {
            if let Err(err) = serve_scrape(stream).await {
                tracing::debug!(error = %err, "metrics scrape failed");
            }
        });
    }
}

async fn serve_scrape(stream: tokio::net::TcpStream) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    timeout(CLIENT_TIMEOUT, reader.read_line(&mut request_line))
        .await
        .context("metrics request timed out")??;

    let ok = request_line.starts_with("GET /metrics ");
    loop {
        let mut header = String::new();
        timeout(CLIENT_TIMEOUT, reader.read_line(&mut header))
            .await
            .context("metrics headers timed out")??;
        if header == "\r\n" || header == "\n" || header.is_empty() {
            break;
        }
    }

    let stream = reader.get_mut();
    if !ok {
        let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        timeout(CLIENT_TIMEOUT, stream.write_all(response.as_bytes())).await??;
        return Ok(());
    }

    let body = gather()?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    timeout(CLIENT_TIMEOUT, stream.write_all(header.as_bytes())).await??;
    timeout(CLIENT_TIMEOUT, stream.write_all(body.as_bytes())).await??;
    Ok(())
}
