use std::time::Duration;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::io_util::write_all_with_timeout;
use crate::logging::AccessLogBuilder;
use crate::util::timeout_with_context;

pub async fn send_response<S>(
    stream: &mut S,
    status: StatusCode,
    content_type: &str,
    body: &[u8],
    timeout_dur: Duration,
) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: {}\r\n\r\n",
        status.as_u16(),
        reason,
        body.len(),
        content_type,
    );
    write_all_with_timeout(
        stream,
        header.as_bytes(),
        timeout_dur,
        "writing response header",
    )
    .await?;
    let mut written = header.len();
    if !body.is_empty() {
        write_all_with_timeout(stream, body, timeout_dur, "writing response body").await?;
        written += body.len();
    }
    Ok(written)
}

pub async fn shutdown_stream<S>(stream: &mut S, timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(timeout_dur, stream.shutdown(), "shutting down client stream").await
}

#[allow(clippy::too_many_arguments)]
pub async fn respond_with_access_log<S>(
    stream: &mut S,
    status: StatusCode,
    content_type: &str,
    body: &[u8],
    timeout_dur: Duration,
    elapsed: Duration,
    log_builder: AccessLogBuilder,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes_out = send_response(stream, status, content_type, body, timeout_dur).await?;
    shutdown_stream(stream, timeout_dur).await?;
    log_builder
        .status(status)
        .bytes_out(bytes_out as u64)
        .elapsed(elapsed)
        .log();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn response_carries_content_type_and_length() {
        let mut sink = Vec::new();
        let written = send_response(
            &mut sink,
            StatusCode::FORBIDDEN,
            "text/html; charset=utf-8",
            b"<h1>Forbidden</h1>",
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let text = String::from_utf8(sink).unwrap();
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(text.contains("Content-Type: text/html; charset=utf-8\r\n"));
        assert!(text.contains("Content-Length: 18\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("<h1>Forbidden</h1>"));
        assert_eq!(written, text.len());
    }
}
