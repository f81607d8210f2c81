//! TCP listener and server main loop

use super::connection::handle_client;
use crate::collab::IdentityResolver;
use crate::gateway::SessionGateway;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Accepts client connections and hands each to its own task
pub struct ServerListener {
    listener: TcpListener,
    gateway: Arc<SessionGateway>,
    identity: Arc<dyn IdentityResolver>,
}

impl ServerListener {
    /// Bind the listening socket
    pub async fn bind(
        addr: SocketAddr,
        gateway: Arc<SessionGateway>,
        identity: Arc<dyn IdentityResolver>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        Ok(Self {
            listener,
            gateway,
            identity,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the server until a shutdown signal arrives
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!("Server listening on {}", addr);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }

                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            tracing::debug!("Accepted connection from {}", addr);
                            let gateway = Arc::clone(&self.gateway);
                            let identity = Arc::clone(&self.identity);
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, gateway, identity).await {
                                    tracing::error!("Client error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        let live_sessions = self.gateway.live_sessions().await.len();
        tracing::info!(live_sessions, "Server stopped");
        Ok(())
    }
}
