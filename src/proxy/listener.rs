use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::{server, AppContext};

pub async fn start_listener(app: AppContext) -> Result<()> {
    let bind_addr = app.settings.listen;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind data-plane listener on {bind_addr}"))?;
    serve_on(listener, app).await
}

/// Accept loop over an already-bound listener; the test harness binds its
/// own ephemeral ports.
pub async fn serve_on(listener: TcpListener, app: AppContext) -> Result<()> {
    if let Ok(local_addr) = listener.local_addr() {
        info!(address = %local_addr, "data-plane listener started");
    }

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept incoming connection");
                continue;
            }
        };
        debug!(peer = %peer_addr, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY on downstream stream");
        }
        let connection_app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = server::handle_connection(stream, peer_addr, connection_app).await {
                debug!(peer = %peer_addr, error = %err, "connection closed with error");
            }
        });
    }
}
