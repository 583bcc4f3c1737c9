use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use http::{StatusCode, Uri};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::io_util::{copy_exact_with_timeout, copy_with_write_timeout, write_all_with_timeout};
use crate::request::WafRequest;
use crate::settings::Settings;
use crate::store::{ResolvedOrigin, Route};
use crate::util::timeout_with_context;

/// Upstream endpoint once a route's origin has been resolved against the
/// service bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginTarget {
    pub host: String,
    pub port: u16,
    /// Host header value presented to the origin.
    pub authority: String,
}

/// Why a dispatch could not even start. Distinct from upstream I/O failures:
/// a misconfiguration is the operator's bug and synthesizes a 500.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct OriginMisconfig(pub String);

/// Resolves a route's origin to a connectable target. Service origins go
/// through the configured bindings. URL origins must be plain `http`; TLS
/// is terminated at the edge on both sides of this process.
pub fn resolve_target(route: &Route, settings: &Settings) -> Result<OriginTarget, OriginMisconfig> {
    let url = match route.origin().map_err(OriginMisconfig)? {
        ResolvedOrigin::Url(url) => url,
        ResolvedOrigin::Service(name) => settings
            .service_bindings
            .get(&name)
            .cloned()
            .ok_or_else(|| {
                OriginMisconfig(format!("no service binding configured for '{name}'"))
            })?,
    };

    let uri: Uri = url
        .parse()
        .map_err(|err| OriginMisconfig(format!("invalid origin url '{url}': {err}")))?;
    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => {
            return Err(OriginMisconfig(format!(
                "origin scheme '{other}' is not dispatchable; terminate TLS at the edge"
            )));
        }
        None => {
            return Err(OriginMisconfig(format!(
                "origin url '{url}' is missing a scheme"
            )));
        }
    }
    let host = uri
        .host()
        .ok_or_else(|| OriginMisconfig(format!("origin url '{url}' is missing a host")))?
        .to_string();
    let port = uri.port_u16().unwrap_or(80);
    let authority = if port == 80 {
        host.clone()
    } else {
        format!("{host}:{port}")
    };
    Ok(OriginTarget {
        host,
        port,
        authority,
    })
}

/// Bytes moved in each direction by a completed dispatch.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchStats {
    pub status: u16,
    pub bytes_to_origin: u64,
    pub bytes_to_client: u64,
}

/// Forwards an admitted request to its origin and streams the response back.
/// The caller has already emitted the dispatch event; errors here surface as
/// a 502 from the caller unless the client stream already carries a partial
/// response (in which case the connection just closes).
#[allow(clippy::too_many_arguments)]
pub async fn dispatch<S>(
    client: &mut BufReader<S>,
    request: &WafRequest,
    route: &Route,
    target: &OriginTarget,
    peer: SocketAddr,
    settings: &Settings,
) -> Result<DispatchStats>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let addr = format!("{}:{}", target.host, target.port);
    let connect = TcpStream::connect(&addr);
    let upstream = match timeout(settings.upstream_connect_timeout(), connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            crate::metrics::record_upstream_error("connect");
            return Err(err).with_context(|| format!("failed to connect to origin {addr}"));
        }
        Err(_) => {
            crate::metrics::record_upstream_error("connect_timeout");
            bail!("connection to origin {addr} timed out");
        }
    };
    if let Err(err) = upstream.set_nodelay(true) {
        debug!(origin = %addr, error = %err, "failed to set TCP_NODELAY on origin stream");
    }
    let mut upstream = BufReader::new(upstream);
    debug!(origin = %addr, route = %route.id, "connected to origin");

    let write_timeout = settings.upstream_timeout();
    let head = build_upstream_head(request, target, peer);
    write_all_with_timeout(
        upstream.get_mut(),
        head.as_bytes(),
        write_timeout,
        "writing request head to origin",
    )
    .await?;
    let mut bytes_to_origin = head.len() as u64;

    bytes_to_origin += forward_request_body(client, &mut upstream, request, write_timeout).await?;

    let (status, response_head) =
        read_response_head(&mut upstream, settings.max_response_header_size, write_timeout)
            .await?;
    write_all_with_timeout(
        client.get_mut(),
        response_head.as_bytes(),
        write_timeout,
        "writing response head to client",
    )
    .await?;
    let mut bytes_to_client = response_head.len() as u64;

    // Connection: close was requested from the origin, so EOF delimits the
    // response body regardless of its framing.
    bytes_to_client += copy_with_write_timeout(
        &mut upstream,
        client.get_mut(),
        write_timeout,
        "streaming response body to client",
    )
    .await?;

    Ok(DispatchStats {
        status,
        bytes_to_origin,
        bytes_to_client,
    })
}

/// Skip set for the upstream hop: connection-scoped headers, the incoming
/// Host (rewritten), and the edge metadata bag, which never leaves the WAF.
fn skip_for_upstream(name: &str) -> bool {
    name.starts_with("proxy-")
        || matches!(
            name,
            "connection"
                | "keep-alive"
                | "te"
                | "trailer"
                | "upgrade"
                | "host"
                | "x-edge-meta"
        )
}

fn build_upstream_head(request: &WafRequest, target: &OriginTarget, peer: SocketAddr) -> String {
    let mut head = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\n",
        request.method, request.target, target.authority
    );
    for (name, value) in &request.headers {
        if skip_for_upstream(name) {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("X-Forwarded-For: {}\r\n", peer.ip()));
    head.push_str(&format!("X-Forwarded-Host: {}\r\n", request.host));
    head.push_str("X-Forwarded-Proto: http\r\n");
    head.push_str("Connection: close\r\n\r\n");
    head
}

async fn forward_request_body<C, U>(
    client: &mut BufReader<C>,
    upstream: &mut BufReader<U>,
    request: &WafRequest,
    write_timeout: Duration,
) -> Result<u64>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    if request.chunked {
        return copy_chunked(client, upstream.get_mut(), write_timeout).await;
    }
    match request.content_length {
        Some(length) if length > 0 => {
            copy_exact_with_timeout(
                client,
                upstream.get_mut(),
                length,
                write_timeout,
                "forwarding request body to origin",
            )
            .await?;
            Ok(length)
        }
        _ => Ok(0),
    }
}

/// Raw chunked-body passthrough: sizes and trailers are forwarded verbatim,
/// so the origin sees exactly the framing the client sent.
async fn copy_chunked<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    write_timeout: Duration,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let mut size_line = String::new();
        let read = reader
            .read_line(&mut size_line)
            .await
            .context("reading chunk size")?;
        if read == 0 {
            bail!("stream ended inside chunked body");
        }
        write_all_with_timeout(writer, size_line.as_bytes(), write_timeout, "forwarding chunk")
            .await?;
        total += size_line.len() as u64;

        let size_text = size_line
            .trim_end()
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        let size = u64::from_str_radix(size_text, 16)
            .with_context(|| format!("invalid chunk size '{size_text}'"))?;

        if size > 0 {
            copy_exact_with_timeout(reader, writer, size + 2, write_timeout, "forwarding chunk")
                .await?;
            total += size + 2;
            continue;
        }

        // Terminal chunk: forward trailers up to the blank line.
        loop {
            let mut trailer = String::new();
            let read = reader
                .read_line(&mut trailer)
                .await
                .context("reading chunk trailer")?;
            if read == 0 {
                bail!("stream ended inside chunk trailers");
            }
            write_all_with_timeout(
                writer,
                trailer.as_bytes(),
                write_timeout,
                "forwarding chunk trailer",
            )
            .await?;
            total += trailer.len() as u64;
            if trailer == "\r\n" || trailer == "\n" {
                return Ok(total);
            }
        }
    }
}

/// Reads the origin's status line and headers, returning the status and the
/// head to replay to the client (hop-by-hop headers removed, close enforced).
async fn read_response_head<U>(
    upstream: &mut BufReader<U>,
    max_bytes: usize,
    read_timeout: Duration,
) -> Result<(u16, String)>
where
    U: AsyncRead + Unpin,
{
    let mut status_line = String::new();
    timeout_with_context(
        read_timeout,
        upstream.read_line(&mut status_line),
        "reading origin status line",
    )
    .await?;
    let status_line = status_line.trim_end();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        bail!("origin spoke '{version}', expected HTTP/1.x");
    }
    let status: u16 = parts
        .next()
        .unwrap_or_default()
        .parse()
        .with_context(|| format!("invalid origin status line '{status_line}'"))?;
    let reason = parts.next().unwrap_or_default();
    let reason = if reason.is_empty() {
        StatusCode::from_u16(status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or("Unknown")
    } else {
        reason
    };

    let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
    let mut consumed = status_line.len();
    loop {
        let mut line = String::new();
        let read = timeout_with_context(
            read_timeout,
            upstream.read_line(&mut line),
            "reading origin response headers",
        )
        .await?;
        if read == 0 {
            bail!("origin closed mid-headers");
        }
        consumed += read;
        if consumed > max_bytes {
            bail!("origin response head exceeds configured limit");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let name = trimmed
            .split(':')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if name.starts_with("proxy-")
            || matches!(name.as_str(), "connection" | "keep-alive" | "te" | "upgrade")
        {
            continue;
        }
        head.push_str(trimmed);
        head.push_str("\r\n");
    }
    head.push_str("Connection: close\r\n\r\n");
    Ok((status, head))
}

pub fn misconfig_body(detail: &str) -> String {
    format!("origin misconfigured: {detail}\n")
}

pub fn upstream_error_body() -> &'static str {
    "upstream request failed\n"
}
