use std::net::SocketAddr;

use anyhow::{anyhow, Result};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Writes raw bytes and reads the whole response (the server always closes).
pub async fn send_raw(addr: SocketAddr, raw: &[u8]) -> Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(raw).await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).to_string())
}

/// Simple origin-form GET against the data plane.
pub async fn get(
    addr: SocketAddr,
    host: &str,
    path: &str,
    extra_headers: &[(&str, &str)],
) -> Result<String> {
    request(addr, "GET", host, path, extra_headers, None).await
}

pub async fn request(
    addr: SocketAddr,
    method: &str,
    host: &str,
    path: &str,
    extra_headers: &[(&str, &str)],
    body: Option<&[u8]>,
) -> Result<String> {
    let mut raw = format!("{method} {path} HTTP/1.1\r\nHost: {host}\r\n");
    for (name, value) in extra_headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    if let Some(body) = body {
        raw.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    raw.push_str("\r\n");
    let mut bytes = raw.into_bytes();
    if let Some(body) = body {
        bytes.extend_from_slice(body);
    }
    send_raw(addr, &bytes).await
}

pub fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|status| status.parse().ok())
        .unwrap_or(0)
}

pub fn body_of(response: &str) -> &str {
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("")
}

pub fn header_of<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split("\r\n\r\n").next()?;
    for line in head.lines().skip(1) {
        if let Some((header, value)) = line.split_once(':') {
            if header.eq_ignore_ascii_case(name) {
                return Some(value.trim());
            }
        }
    }
    None
}

/// JSON call against the admin plane with a resolved actor identity.
pub async fn api_call(
    addr: SocketAddr,
    method: &str,
    path: &str,
    actor: Option<(&str, &str)>,
    body: Option<&Value>,
) -> Result<(u16, Value)> {
    let mut raw = format!("{method} {path} HTTP/1.1\r\nHost: admin.internal\r\n");
    if let Some((name, role)) = actor {
        raw.push_str(&format!("X-Admin-Actor: {name}\r\nX-Admin-Role: {role}\r\n"));
    }
    let encoded = body.map(|value| value.to_string());
    if let Some(encoded) = &encoded {
        raw.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n",
            encoded.len()
        ));
    }
    raw.push_str("\r\n");
    let mut bytes = raw.into_bytes();
    if let Some(encoded) = &encoded {
        bytes.extend_from_slice(encoded.as_bytes());
    }

    let response = send_raw(addr, &bytes).await?;
    let status = status_of(&response);
    if status == 0 {
        return Err(anyhow!("unparseable admin response: {response}"));
    }
    let body = body_of(&response);
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(body)?
    };
    Ok((status, value))
}
