//! Connected-client protocol handler
//!
//! Serves the setup-phase operations on a fresh connection: device list
//! requests loop back to waiting for the next command, an accepted import
//! hands the socket over to the attached session, and anything malformed is
//! answered with a failure status and a close.

use super::ServerState;
use super::session::{self, run_session};
use crate::enumerator::find_connected;
use anyhow::{Context as _, Result};
use protocol::op::{
    OP_DEVLIST, OP_IMPORT, OP_STATUS_ERROR, write_devlist_reply, write_import_reply_ok,
};
use protocol::{BusId, ExportedDevice, OpHeader, USBIP_VERSION};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Per-connection protocol handler
pub struct ClientConnection {
    socket: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
    shutdown: watch::Receiver<bool>,
}

impl ClientConnection {
    pub fn new(
        socket: TcpStream,
        peer: SocketAddr,
        state: Arc<ServerState>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            socket,
            peer,
            state,
            shutdown,
        }
    }

    /// Serve setup-phase commands until the connection closes or an import
    /// succeeds and the session takes over
    pub async fn run(mut self) -> Result<()> {
        loop {
            let mut raw = [0u8; OpHeader::SIZE];
            tokio::select! {
                _ = self.shutdown.changed() => return Ok(()),
                res = self.socket.read_exact(&mut raw) => {
                    match res {
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            debug!("client {} closed the connection", self.peer);
                            return Ok(());
                        }
                        Err(e) => return Err(e).context("reading request header"),
                    }
                }
            }

            let header = OpHeader::read_from(&mut Cursor::new(&raw[..]))
                .context("decoding request header")?;

            if header.version != USBIP_VERSION {
                warn!(
                    "client {} spoke version {:#06x}, closing",
                    self.peer, header.version
                );
                self.reply_error(header.code).await?;
                return Ok(());
            }

            match header.code {
                OP_DEVLIST => self.handle_devlist().await?,
                OP_IMPORT => return self.handle_import().await,
                code => {
                    warn!("client {} sent unknown op {:#06x}, closing", self.peer, code);
                    self.reply_error(code).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn reply_error(&mut self, code: u16) -> Result<()> {
        let mut buf = Vec::new();
        OpHeader::reply(code, OP_STATUS_ERROR).write_to(&mut buf)?;
        self.socket.write_all(&buf).await?;
        Ok(())
    }

    async fn handle_devlist(&mut self) -> Result<()> {
        let exports = self.exportable_devices().await?;
        debug!(
            "DEVLIST: {} device(s) for client {}",
            exports.len(),
            self.peer
        );

        let mut buf = Vec::new();
        write_devlist_reply(&mut buf, &exports)?;
        self.socket.write_all(&buf).await?;
        Ok(())
    }

    async fn handle_import(mut self) -> Result<()> {
        let mut field = [0u8; BusId::FIELD_LEN];
        self.socket
            .read_exact(&mut field)
            .await
            .context("reading import busid")?;

        let bus_id = match BusId::from_field(&field) {
            Ok(bus_id) => bus_id,
            Err(e) => {
                info!("IMPORT from {} rejected: {}", self.peer, e);
                return self.reply_error(OP_IMPORT).await;
            }
        };

        // Shared, and physically present right now.
        if !self.state.registry.is_shared(bus_id) {
            info!("IMPORT {} from {} rejected: not shared", bus_id, self.peer);
            return self.reply_error(OP_IMPORT).await;
        }
        let enumerator = self.state.enumerator.clone();
        let discovered = tokio::task::spawn_blocking(move || {
            find_connected(enumerator.as_ref(), bus_id, false)
        })
        .await
        .context("enumeration task")?;
        let Some(discovered) = discovered else {
            info!(
                "IMPORT {} from {} rejected: not connected",
                bus_id, self.peer
            );
            return self.reply_error(OP_IMPORT).await;
        };
        let export = discovered.export;
        let mut reply = Vec::new();
        write_import_reply_ok(&mut reply, &export)?;

        // The registry arbitrates exclusivity; losing the race is a policy
        // error, not a protocol one.
        let session_id = session::next_session_id();
        if let Err(e) = self
            .state
            .registry
            .mark_attached(bus_id, self.peer, session_id)
        {
            info!("IMPORT {} from {} rejected: {}", bus_id, self.peer, e);
            return self.reply_error(OP_IMPORT).await;
        }

        let (completion_tx, completion_rx) = mpsc::channel(session::COMPLETION_QUEUE_DEPTH);
        let driver = self.state.driver.clone();
        let open_export = export.clone();
        let opened = tokio::task::spawn_blocking(move || driver.open(&open_export, completion_tx))
            .await
            .context("capture open task")?;
        let device = match opened {
            Ok(device) => Arc::new(device),
            Err(e) => {
                warn!("IMPORT {} from {} failed to capture: {}", bus_id, self.peer, e);
                if let Err(e) = self.state.registry.mark_detached(bus_id) {
                    warn!("mark_detached after failed capture: {}", e);
                }
                return self.reply_error(OP_IMPORT).await;
            }
        };

        // Start the client from a clean device state, as a fresh plug would.
        // A device that vanished between enumeration and here cannot be
        // attached; a merely refused reset can.
        let reset_device = device.clone();
        match tokio::task::spawn_blocking(move || reset_device.reset()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_fatal_for_session() => {
                warn!("IMPORT {} from {} aborted: {}", bus_id, self.peer, e);
                device.release();
                if let Err(e) = self.state.registry.mark_detached(bus_id) {
                    warn!("mark_detached after failed reset: {}", e);
                }
                return self.reply_error(OP_IMPORT).await;
            }
            Ok(Err(e)) => warn!("reset of {} before attach failed: {}", bus_id, e),
            Err(e) => warn!("reset task for {} failed: {}", bus_id, e),
        }

        if let Err(e) = self.socket.write_all(&reply).await {
            device.release();
            if let Err(e) = self.state.registry.mark_detached(bus_id) {
                warn!("mark_detached after failed reply: {}", e);
            }
            return Err(e).context("writing import reply");
        }
        info!(
            "client {} imported {} (session {})",
            self.peer, bus_id, session_id
        );

        run_session(
            self.socket,
            device,
            completion_rx,
            self.state.registry.clone(),
            self.state.limits,
            self.shutdown,
            self.state.sink.clone(),
        )
        .await
    }

    async fn exportable_devices(&self) -> Result<Vec<ExportedDevice>> {
        let enumerator = self.state.enumerator.clone();
        let discovered =
            tokio::task::spawn_blocking(move || enumerator.list_connected(false))
                .await
                .context("enumeration task")?;

        let devlist_all = self.state.devlist_all;
        Ok(discovered
            .into_iter()
            .map(|d| d.export)
            .filter(|e| devlist_all || self.state.registry.is_shared(e.bus_id))
            .collect())
    }
}
