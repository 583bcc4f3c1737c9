use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::timeout_with_context;

pub async fn write_all_with_timeout<W: AsyncWrite + Unpin, C: Into<String>>(
    writer: &mut W,
    buf: &[u8],
    timeout: Duration,
    context: C,
) -> Result<()> {
    timeout_with_context(timeout, writer.write_all(buf), context).await
}

/// Copies until EOF, bounding every write by `timeout`. Returns bytes copied.
pub async fn copy_with_write_timeout<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    reader: &mut R,
    writer: &mut W,
    timeout: Duration,
    context: &str,
) -> Result<u64> {
    let mut total = 0u64;
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        write_all_with_timeout(writer, &buffer[..read], timeout, context).await?;
        total = total.saturating_add(read as u64);
    }
    Ok(total)
}

/// Copies exactly `length` bytes, bounding every write by `timeout`.
pub async fn copy_exact_with_timeout<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    reader: &mut R,
    writer: &mut W,
    length: u64,
    timeout: Duration,
    context: &str,
) -> Result<()> {
    let mut remaining = length;
    let mut buffer = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(buffer.len() as u64) as usize;
        let read = reader.read(&mut buffer[..want]).await?;
        if read == 0 {
            anyhow::bail!("stream ended {remaining} bytes early while {context}");
        }
        write_all_with_timeout(writer, &buffer[..read], timeout, context).await?;
        remaining -= read as u64;
    }
    Ok(())
}
