use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Context, Result};
use http::Method;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;

use crate::util::timeout_with_context;

/// Parsed HTTP/1.1 request head: the request line plus accumulated headers.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderAccumulator,
}

/// Collects request headers while enforcing size limits and the invariants
/// the forwarding path depends on (single Host, single framing declaration).
/// Every observed header is retained for field projection; forwarding applies
/// its own filter.
#[derive(Debug)]
pub(crate) struct HeaderAccumulator {
    max_bytes: usize,
    consumed: usize,
    headers: Vec<(String, String)>,
    host: Option<String>,
    content_length: Option<u64>,
    chunked: bool,
}

impl HeaderAccumulator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            consumed: 0,
            headers: Vec::new(),
            host: None,
            content_length: None,
            chunked: false,
        }
    }

    /// Feeds one raw header line. Returns false on the blank terminator.
    pub fn push_line(&mut self, line: &str) -> Result<bool> {
        self.consumed = self
            .consumed
            .checked_add(line.len())
            .ok_or_else(|| anyhow!("header section exceeds configured limit"))?;
        ensure!(
            self.consumed <= self.max_bytes,
            "header section exceeds configured limit"
        );

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(false);
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().to_string();
        ensure!(!name.is_empty(), "header name must not be empty");
        ensure!(
            http::header::HeaderName::from_bytes(name.as_bytes()).is_ok(),
            "invalid header name '{name}'"
        );

        match name.as_str() {
            "host" => {
                if self.host.is_some() {
                    bail!("duplicate Host header");
                }
                ensure!(!value.is_empty(), "Host header must not be empty");
                self.host = Some(normalize_host(&value)?);
            }
            "content-length" => {
                if self.chunked {
                    bail!("request must not include both Content-Length and Transfer-Encoding");
                }
                if self.content_length.is_some() {
                    bail!("multiple Content-Length headers are not supported");
                }
                let length: u64 = value
                    .parse()
                    .with_context(|| format!("invalid Content-Length value '{value}'"))?;
                self.content_length = Some(length);
            }
            "transfer-encoding" => {
                if self.chunked {
                    bail!("duplicate Transfer-Encoding header");
                }
                if self.content_length.is_some() {
                    bail!("request must not include both Content-Length and Transfer-Encoding");
                }
                let encodings: Vec<String> = value
                    .split(',')
                    .map(|item| item.trim().to_ascii_lowercase())
                    .filter(|item| !item.is_empty())
                    .collect();
                if encodings.len() != 1 || encodings[0] != "chunked" {
                    bail!("unsupported Transfer-Encoding '{value}'");
                }
                self.chunked = true;
            }
            _ => {}
        }

        self.headers.push((name, value));
        Ok(true)
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn into_headers(self) -> Vec<(String, String)> {
        self.headers
    }
}

/// Lowercases and validates a Host header value, keeping any port out of the
/// routed name.
fn normalize_host(value: &str) -> Result<String> {
    ensure!(
        !value.chars().any(|c| c.is_whitespace()),
        "Host header must not contain whitespace"
    );
    ensure!(
        !value.contains('@') && !value.contains('/'),
        "Host header must not contain userinfo or path"
    );
    let lower = value.to_ascii_lowercase();
    let host = if let Some(rest) = lower.strip_prefix('[') {
        // IPv6 literal, possibly with a port after the bracket.
        rest.split(']').next().unwrap_or(rest).to_string()
    } else {
        lower.split(':').next().unwrap_or(&lower).to_string()
    };
    ensure!(!host.is_empty(), "Host header missing hostname");
    Ok(host)
}

/// Reads one request head within `header_timeout`, waiting up to
/// `idle_timeout` for the first byte. `Ok(None)` means the peer closed or
/// went idle without starting a request.
pub(crate) async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let available = match tokio::time::timeout(idle_timeout, reader.fill_buf()).await {
        Ok(Ok(buffer)) => buffer,
        Ok(Err(err)) => {
            return Err(err).with_context(|| format!("waiting for request data from {peer}"));
        }
        Err(_) => return Ok(None),
    };
    if available.is_empty() {
        return Ok(None);
    }

    let deadline = Instant::now() + header_timeout;
    let Some(request_line) = read_line(reader, peer, deadline, max_header_bytes).await? else {
        return Ok(None);
    };
    ensure!(!request_line.is_empty(), "empty request line from {peer}");

    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    match version {
        "HTTP/1.1" => {}
        "HTTP/1.0" => bail!("HTTP/1.0 requests are not supported"),
        other => bail!("invalid HTTP version '{other}'"),
    }
    ensure!(
        target.starts_with('/') || (method_str == "OPTIONS" && target == "*"),
        "request target must be origin-form"
    );
    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;
    bail_on_connect(&method)?;

    let mut headers = HeaderAccumulator::new(max_header_bytes);
    loop {
        let Some(line) = read_line(reader, peer, deadline, max_header_bytes).await? else {
            bail!("connection closed while reading headers from {peer}");
        };
        if !headers
            .push_line(&format!("{line}\r\n"))
            .with_context(|| format!("invalid header from {peer}"))?
        {
            break;
        }
    }

    Ok(Some(RequestHead {
        method,
        target: target.to_string(),
        headers,
    }))
}

fn bail_on_connect(method: &Method) -> Result<()> {
    ensure!(
        method != Method::CONNECT,
        "CONNECT is not supported on the data plane"
    );
    Ok(())
}

/// Reads a single CRLF-terminated line under the shared header deadline.
/// `Ok(None)` only when the stream ends cleanly before any byte of the line.
async fn read_line<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    deadline: Instant,
    max_len: usize,
) -> Result<Option<String>>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let context = format!("reading request head from {peer}");

    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
            .ok_or_else(|| anyhow!("timed out {context}"))?;
        let available = timeout_with_context(remaining, reader.fill_buf(), context.as_str()).await?;

        if available.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            bail!("connection closed mid-line from {peer}");
        }

        let newline = available.iter().position(|byte| *byte == b'\n');
        let consume = newline.map(|idx| idx + 1).unwrap_or(available.len());
        if line.len() + consume > max_len {
            bail!("request head line exceeds configured limit of {max_len} bytes");
        }
        line.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline.is_some() {
            break;
        }
    }

    let mut text =
        String::from_utf8(line).map_err(|_| anyhow!("request head contained invalid bytes"))?;
    text.pop();
    if text.ends_with('\r') {
        text.pop();
    }
    Ok(Some(text))
}
