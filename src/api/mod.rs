pub mod auth;
pub mod error;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use http::StatusCode;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::events::EventSink;
use crate::proxy::codec::read_request_head;
use crate::proxy::respond::{send_response, shutdown_stream};
use crate::settings::Settings;
use crate::store::StoreRegistry;

use self::error::ApiError;
use self::handlers::dispatch;

/// Largest accepted configuration payload. Rule expressions and error pages
/// are small; anything bigger is a client bug.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared state of the admin plane.
#[derive(Clone)]
pub struct ApiContext {
    pub registry: Arc<StoreRegistry>,
    pub events: Arc<dyn EventSink>,
}

pub async fn serve(settings: Arc<Settings>, ctx: ApiContext) -> Result<()> {
    let bind_addr = settings.api_listen;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind admin listener on {bind_addr}"))?;
    serve_on(listener, settings, ctx).await
}

/// Accept loop over an already-bound listener; the test harness binds its
/// own ephemeral ports.
pub async fn serve_on(
    listener: TcpListener,
    settings: Arc<Settings>,
    ctx: ApiContext,
) -> Result<()> {
    if let Ok(local_addr) = listener.local_addr() {
        info!(address = %local_addr, "admin API listener started");
    }

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept admin connection");
                continue;
            }
        };
        let connection_ctx = ctx.clone();
        let connection_settings = settings.clone();
        tokio::spawn(async move {
            if let Err(err) =
                handle_connection(stream, peer_addr, connection_settings, connection_ctx).await
            {
                debug!(peer = %peer_addr, error = %err, "admin connection closed with error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    settings: Arc<Settings>,
    ctx: ApiContext,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let head = match read_request_head(
        &mut reader,
        peer,
        settings.client_timeout(),
        settings.client_timeout(),
        settings.max_header_size,
    )
    .await
    {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(err) => {
            debug!(peer = %peer, error = %err, "malformed admin request");
            let body = ApiError::bad_request("malformed request").body().to_string();
            let _ = send_response(
                reader.get_mut(),
                StatusCode::BAD_REQUEST,
                "application/json",
                body.as_bytes(),
                settings.client_timeout(),
            )
            .await;
            let _ = shutdown_stream(reader.get_mut(), settings.client_timeout()).await;
            return Ok(());
        }
    };

    let method = head.method.clone();
    let target = head.target.clone();
    let content_length = head.headers.content_length().unwrap_or(0) as usize;
    let headers = head.headers.into_headers();

    let (status, body) = if content_length > MAX_BODY_BYTES {
        let err = ApiError::payload_too_large(MAX_BODY_BYTES);
        (err.status, err.body())
    } else {
        let mut body = vec![0u8; content_length];
        if content_length > 0 {
            crate::util::timeout_with_context(
                settings.client_timeout(),
                reader.read_exact(&mut body),
                "reading admin request body",
            )
            .await?;
        }
        match dispatch(&ctx, &method, &target, &headers, &body).await {
            Ok(response) => (response.status, response.body),
            Err(err) => (err.status, err.body()),
        }
    };

    let payload = body.to_string();
    send_response(
        reader.get_mut(),
        status,
        "application/json",
        payload.as_bytes(),
        settings.client_timeout(),
    )
    .await?;
    shutdown_stream(reader.get_mut(), settings.client_timeout()).await?;
    Ok(())
}
