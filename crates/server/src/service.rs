//! Process lifecycle
//!
//! Startup and shutdown for the server proper: the single-instance guard,
//! systemd sd-notify integration, signal handling, and the orchestration
//! that wires registry, enumerator, capture driver, capture sink, and
//! listener together.

use crate::capture::UsbCaptureDriver;
use crate::config::ServerConfig;
use crate::enumerator::UsbEnumerator;
use crate::net::{Listener, ServerState};
use crate::pcap::spawn_capture_writer;
use crate::registry::BindingRegistry;
use anyhow::{Context, Result, bail};
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use std::os::unix::net::UnixDatagram;

/// How long connections get to unwind after the shutdown signal
const SHUTDOWN_DEADLINE: std::time::Duration = std::time::Duration::from_secs(5);

/// System-wide single-instance guard
///
/// A lock file carrying the holder's PID. A second instance fails fast with
/// a distinguishable error; a lock left behind by a dead process is
/// reclaimed.
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("creating state dir {}", state_dir.display()))?;
        let path = state_dir.join("usbip-share.lock");

        for _ in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    use std::io::Write;
                    let mut file = file;
                    let _ = write!(file, "{}", std::process::id());
                    debug!("instance lock acquired at {}", path.display());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder: Option<u32> = fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse().ok());
                    if let Some(pid) = holder {
                        if process_alive(pid) {
                            bail!(
                                "another usbip-share instance is already running (pid {})",
                                pid
                            );
                        }
                        warn!("reclaiming stale instance lock held by dead pid {}", pid);
                    } else {
                        warn!("reclaiming unreadable instance lock");
                    }
                    let _ = fs::remove_file(&path);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("creating instance lock {}", path.display()));
                }
            }
        }
        bail!("could not acquire instance lock at {}", path.display())
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap liveness probe; assume the holder is alive.
    true
}

/// Notify systemd that the service is ready
pub fn notify_ready() {
    sd_notify(b"READY=1");
}

/// Notify systemd that the service is stopping
pub fn notify_stopping() {
    sd_notify(b"STOPPING=1");
}

/// Send a status line visible in `systemctl status`
pub fn notify_status(status: &str) {
    sd_notify(format!("STATUS={status}").as_bytes());
}

/// Check if running under systemd
pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}

#[cfg(unix)]
fn sd_notify(message: &[u8]) {
    let Ok(socket_path) = env::var("NOTIFY_SOCKET") else {
        return;
    };
    match UnixDatagram::unbound() {
        Ok(socket) => {
            if let Err(e) = socket.send_to(message, &socket_path) {
                debug!("sd_notify failed: {}", e);
            }
        }
        Err(e) => debug!("sd_notify socket: {}", e),
    }
}

#[cfg(not(unix))]
fn sd_notify(_message: &[u8]) {}

/// Run the server until a shutdown signal arrives
///
/// Explicit lifecycle: acquire the instance lock, open the registry and
/// reset stale attachments, start the listener, notify readiness, await a
/// signal, trip the shutdown scope, and join everything with a deadline.
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let state_dir = config.state_dir();
    let _lock = InstanceLock::acquire(&state_dir)?;

    let registry = Arc::new(
        BindingRegistry::open(config.registry_path())
            .with_context(|| format!("opening registry at {}", config.registry_path().display()))?,
    );
    registry
        .reset_attachments()
        .context("clearing stale attachments")?;

    let enumerator = Arc::new(UsbEnumerator::new().context("initializing USB enumeration")?);
    let driver = Arc::new(
        UsbCaptureDriver::new(config.usb.per_endpoint_inflight)
            .context("initializing USB capture driver")?,
    );

    let (sink, sink_task) = if config.capture.enabled {
        let path = config.capture_path();
        let (sink, task) = spawn_capture_writer(&path)
            .await
            .with_context(|| format!("opening capture file {}", path.display()))?;
        (Some(sink), Some(task))
    } else {
        (None, None)
    };

    let state = Arc::new(ServerState {
        registry: registry.clone(),
        enumerator,
        driver,
        limits: config.limits(),
        devlist_all: config.server.devlist_all_devices,
        sink,
    });

    let listener = Listener::bind(config.server.port, config.server.dual_stack).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(listener.run(state.clone(), shutdown_rx));

    if is_systemd() {
        info!("running under systemd");
    }
    notify_ready();
    notify_status("Running - waiting for connections");
    info!("usbip-share server ready");

    wait_for_signal().await;

    info!("shutting down");
    notify_stopping();
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(SHUTDOWN_DEADLINE, server).await.is_err() {
        error!("listener did not stop within {:?}", SHUTDOWN_DEADLINE);
    }

    // Closing the sink: drop the last handle (inside state) and wait for the
    // writer to emit its statistics block.
    drop(state);
    if let Some(task) = sink_task {
        if tokio::time::timeout(SHUTDOWN_DEADLINE, task).await.is_err() {
            warn!("capture sink did not flush within {:?}", SHUTDOWN_DEADLINE);
        }
    }

    info!("server shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal as unix_signal};

    let mut sigterm = match unix_signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("installing SIGTERM handler: {}", e);
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => info!("received Ctrl+C"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = signal::ctrl_c().await;
}
