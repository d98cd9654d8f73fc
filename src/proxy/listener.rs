use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use super::{AppContext, http};

/// A bound but not yet serving proxy; lets callers learn the ephemeral port
/// before the accept loop starts.
pub struct BoundProxy {
    pub local_addr: SocketAddr,
    listener: TcpListener,
    app: AppContext,
}

pub async fn bind(app: AppContext) -> Result<BoundProxy> {
    let bind_addr = app.settings.listen;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    let local_addr = listener.local_addr().unwrap_or(bind_addr);
    Ok(BoundProxy {
        local_addr,
        listener,
        app,
    })
}

impl BoundProxy {
    pub async fn serve(self) -> Result<()> {
        info!(address = %self.local_addr, "caching proxy listener started");
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    error!(error = %err, "failed to accept incoming connection");
                    continue;
                }
            };
            debug!(peer = %peer_addr, "accepted connection");
            if let Err(err) = stream.set_nodelay(true) {
                debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY");
            }
            let connection_app = self.app.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, peer_addr, connection_app).await {
                    debug!(peer = %peer_addr, error = %err, "connection closed with error");
                }
            });
        }
    }
}

pub async fn start_listener(app: AppContext) -> Result<()> {
    bind(app).await?.serve().await
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    http::handle_http(stream, peer, app).await
}
