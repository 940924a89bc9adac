//! API Server
//!
//! Binds the REST router to the process endpoint and serves it until
//! shutdown is requested.

use super::rest::{router, ApiState};
use crate::error::{Error, Result};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Turn a listen endpoint (`tcp://host:port`, `http://host:port` or
/// `host:port`) into a socket address
pub fn listen_addr(endpoint: &str) -> Result<SocketAddr> {
    let addr = endpoint
        .strip_prefix("tcp://")
        .or_else(|| endpoint.strip_prefix("http://"))
        .unwrap_or(endpoint)
        .trim_end_matches('/');
    addr.parse().map_err(|e| {
        Error::Configuration(format!("invalid listen endpoint {:?}: {}", endpoint, e))
    })
}

/// REST server for one process
pub struct ApiServer {
    listener: TcpListener,
    state: ApiState,
}

impl ApiServer {
    /// Bind the listen socket
    pub async fn bind(addr: SocketAddr, state: ApiState) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind API server to {}: {}", addr, e)))?;
        Ok(Self { listener, state })
    }

    /// Address actually bound, useful with port 0
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve requests until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!("API server listening on {}", addr);

        axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("API server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("API server error: {}", e)))
    }
}
