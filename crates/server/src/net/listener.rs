//! TCP listener
//!
//! Binds the USB/IP port on IPv4 and, when available, IPv6. Each accepted
//! connection gets its own task and a clone of the shutdown signal; listener
//! shutdown cancels every open connection cooperatively.

use super::ServerState;
use super::client::ClientConnection;
use anyhow::{Context as _, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// The IANA-assigned USB/IP port
pub const USBIP_PORT: u16 = 3240;

pub struct Listener {
    v4: TcpListener,
    v6: Option<TcpListener>,
}

impl Listener {
    /// Bind the listening sockets
    ///
    /// The IPv6 socket is best-effort: platforms that map IPv4 into a
    /// dual-stack v6 socket may refuse the second bind, which is fine.
    pub async fn bind(port: u16, dual_stack: bool) -> Result<Self> {
        let v4 = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("binding 0.0.0.0:{port}"))?;
        let bound_port = v4.local_addr()?.port();

        let v6 = if dual_stack {
            match TcpListener::bind(("::", bound_port)).await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    debug!("IPv6 listener unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        info!(
            "listening on 0.0.0.0:{}{}",
            bound_port,
            if v6.is_some() { " and [::]" } else { "" }
        );
        Ok(Self { v4, v6 })
    }

    /// The bound IPv4 address (useful when bound to port 0)
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.v4.local_addr()
    }

    /// Accept connections until the shutdown signal trips
    pub async fn run(self, state: Arc<ServerState>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                res = self.v4.accept() => res,
                res = accept_optional(&self.v6) => res,
            };

            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };

            if let Err(e) = socket.set_nodelay(true) {
                debug!("set_nodelay for {}: {}", peer, e);
            }
            info!("connection from {}", peer);

            let connection =
                ClientConnection::new(socket, peer, state.clone(), shutdown.clone());
            tokio::spawn(async move {
                if let Err(e) = connection.run().await {
                    error!("connection {} error: {:#}", peer, e);
                }
            });
        }

        info!("listener stopped");
    }
}

async fn accept_optional(
    listener: &Option<TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
