//! TCP listener accepting one execution session per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::net::TcpListener;
use tokio_stream::{wrappers::TcpListenerStream, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use runbox_exec::{Backend, WorkspaceStore};

use crate::config::SessionSettings;
use crate::session;

/// Shared state handed to every session task. Sessions own no state of
/// each other's; everything here is either immutable or safe to share.
pub struct SessionContext {
    pub store: WorkspaceStore,
    pub backend: Arc<dyn Backend>,
    pub settings: SessionSettings,
}

pub struct RunboxServer {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    ctx: Arc<SessionContext>,
}

impl RunboxServer {
    pub async fn bind(addr: SocketAddr, ctx: SessionContext) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("runbox daemon listening on {}", local_addr);

        Ok(Self {
            listener: Some(listener),
            local_addr,
            ctx: Arc::new(ctx),
        })
    }

    /// The address the listener actually bound; tests bind port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("server not initialized"))?;
        let mut incoming = TcpListenerStream::new(listener);

        while let Some(stream) = incoming.next().await {
            match stream {
                Ok(socket) => {
                    let session_id = Uuid::new_v4().to_string();
                    let peer = socket
                        .peer_addr()
                        .map(|addr| addr.to_string())
                        .unwrap_or_else(|_| "unknown".to_string());
                    info!("accepted connection from {} as session {}", peer, session_id);

                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = session::run_session(ctx, session_id.clone(), socket).await
                        {
                            error!("session {} ended with error: {:#}", session_id, err);
                        }
                    });
                }
                Err(err) => {
                    warn!("error accepting connection: {}", err);
                }
            }
        }

        Ok(())
    }

    /// Best-effort cleanup on graceful shutdown: every session workspace
    /// under the root is ephemeral daemon-owned state.
    pub async fn shutdown(self) {
        info!("shutting down runbox daemon");
        self.ctx.store.destroy_all().await;
    }
}
