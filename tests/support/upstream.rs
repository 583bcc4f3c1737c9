use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone)]
enum UpstreamBehavior {
    Close,
    HttpResponse { response: Arc<Vec<u8>> },
}

/// Stub origin: accepts connections, optionally records the raw request, and
/// answers with a canned response.
pub struct TestUpstream {
    addr: SocketAddr,
    captured: Arc<Mutex<Vec<Vec<u8>>>>,
    handle: JoinHandle<()>,
}

impl TestUpstream {
    pub async fn close() -> Result<Self> {
        Self::spawn(UpstreamBehavior::Close).await
    }

    pub async fn http_response(response: impl Into<Vec<u8>>) -> Result<Self> {
        Self::spawn(UpstreamBehavior::HttpResponse {
            response: Arc::new(response.into()),
        })
        .await
    }

    pub async fn http_ok(body: &str) -> Result<Self> {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        Self::http_response(response.into_bytes()).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.addr.port())
    }

    /// Raw request bytes observed so far, one entry per connection.
    pub fn captured_requests(&self) -> Vec<String> {
        self.captured
            .lock()
            .iter()
            .map(|raw| String::from_utf8_lossy(raw).to_string())
            .collect()
    }

    async fn spawn(behavior: UpstreamBehavior) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let captured = Arc::new(Mutex::new(Vec::new()));
        let capture_handle = captured.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let behavior = behavior.clone();
                let capture = capture_handle.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(&mut stream, behavior, capture).await;
                });
            }
        });
        Ok(Self {
            addr,
            captured,
            handle,
        })
    }
}

impl Drop for TestUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: &mut TcpStream,
    behavior: UpstreamBehavior,
    capture: Arc<Mutex<Vec<Vec<u8>>>>,
) -> Result<()> {
    match behavior {
        UpstreamBehavior::Close => {
            stream.shutdown().await.ok();
        }
        UpstreamBehavior::HttpResponse { response } => {
            let request = read_until_double_crlf(stream).await?;
            capture.lock().push(request);
            stream.write_all(&response).await?;
            stream.shutdown().await.ok();
        }
    }
    Ok(())
}

async fn read_until_double_crlf(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut collected = Vec::new();
    let mut buffer = [0u8; 1024];
    loop {
        let read = stream.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        collected.extend_from_slice(&buffer[..read]);
        if collected.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }
    Ok(collected)
}
