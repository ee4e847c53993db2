//! Persistent binding registry
//!
//! The durable mapping from bus id to shared status. Binding survives server
//! restarts; attachment is transient session state that happens to be
//! persisted for observability and is wiped on every server start.
//!
//! The registry is the sole attachment-exclusivity arbiter: `mark_attached`
//! is a test-and-set under the registry lock, so two sessions racing to
//! import the same device always resolve to exactly one winner.

use protocol::BusId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registry operation errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device {0} is already shared")]
    AlreadyShared(BusId),

    #[error("device {0} is not shared")]
    NotShared(BusId),

    #[error("no shared device with guid {0}")]
    NotFound(Uuid),

    #[error("device {0} is not connected")]
    NotPresent(BusId),

    #[error("device {0} is already attached to another client")]
    AlreadyAttached(BusId),

    #[error("access denied writing registry at {0}")]
    AccessDenied(PathBuf),

    #[error("registry store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// The client currently serving URBs for a shared device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedTo {
    pub client_addr: SocketAddr,
    pub session_id: u64,
}

/// One shared device as stored in the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDevice {
    pub bus_id: BusId,
    /// Stable identifier that addresses the device even while unplugged
    #[serde(skip)]
    pub guid: Uuid,
    pub description: String,
    pub instance_id: String,
    /// Transient; reset to None on server start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached: Option<AttachedTo>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    devices: BTreeMap<Uuid, SharedDevice>,
}

impl RegistryFile {
    fn by_bus_id(&self, bus_id: BusId) -> Option<(Uuid, &SharedDevice)> {
        self.devices
            .iter()
            .find(|(_, d)| d.bus_id == bus_id)
            .map(|(g, d)| (*g, d))
    }
}

/// The persistent binding registry
///
/// All operations take `&self`; the file is rewritten atomically (temp file
/// plus rename) inside the registry lock on every mutation.
pub struct BindingRegistry {
    path: PathBuf,
    state: Mutex<RegistryFile>,
}

impl BindingRegistry {
    /// Open (or create) the registry at `path`
    ///
    /// Attachment markers left behind by a previous process are preserved
    /// until [`reset_attachments`](Self::reset_attachments) is called; the
    /// server does that at startup, the CLI does not.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(text) => {
                toml::from_str(&text).map_err(|e| RegistryError::Store(e.to_string()))?
            }
            Err(e) if e.kind() == ErrorKind::NotFound => RegistryFile::default(),
            Err(e) => return Err(io_error(e, &path)),
        };

        let registry = Self {
            path,
            state: Mutex::new(state),
        };
        registry.restore_guids();
        Ok(registry)
    }

    // Guids are the map keys on disk; mirror them into the records.
    fn restore_guids(&self) {
        let mut state = self.state.lock().expect("registry lock");
        for (guid, device) in state.devices.iter_mut() {
            device.guid = *guid;
        }
    }

    /// Clear every attachment marker (server startup)
    pub fn reset_attachments(&self) -> Result<()> {
        let mut state = self.state.lock().expect("registry lock");
        let stale = state.devices.values().filter(|d| d.attached.is_some()).count();
        if stale > 0 {
            info!("Clearing {} stale attachment marker(s)", stale);
            for device in state.devices.values_mut() {
                device.attached = None;
            }
            self.persist(&state)?;
        }
        Ok(())
    }

    /// Share a device
    ///
    /// Assigns a fresh persistent guid. Binding an already-shared bus id is
    /// rejected with `AlreadyShared`; callers treat that as an informational
    /// no-op.
    pub fn bind(
        &self,
        bus_id: BusId,
        description: String,
        instance_id: String,
    ) -> Result<SharedDevice> {
        let mut state = self.state.lock().expect("registry lock");
        if let Some((_, existing)) = state.by_bus_id(bus_id) {
            debug!("bind {}: already shared as {}", bus_id, existing.guid);
            return Err(RegistryError::AlreadyShared(bus_id));
        }

        let device = SharedDevice {
            bus_id,
            guid: Uuid::new_v4(),
            description,
            instance_id,
            attached: None,
        };
        state.devices.insert(device.guid, device.clone());
        self.persist(&state)?;
        info!("Shared device {} as {}", bus_id, device.guid);
        Ok(device)
    }

    /// Stop sharing by bus id
    pub fn unbind_bus_id(&self, bus_id: BusId) -> Result<()> {
        let mut state = self.state.lock().expect("registry lock");
        let Some((guid, _)) = state.by_bus_id(bus_id) else {
            return Err(RegistryError::NotShared(bus_id));
        };
        state.devices.remove(&guid);
        self.persist(&state)?;
        info!("Unshared device {}", bus_id);
        Ok(())
    }

    /// Stop sharing by persistent guid (works while the device is unplugged)
    pub fn unbind_guid(&self, guid: Uuid) -> Result<()> {
        let mut state = self.state.lock().expect("registry lock");
        if state.devices.remove(&guid).is_none() {
            return Err(RegistryError::NotFound(guid));
        }
        self.persist(&state)?;
        info!("Unshared device {}", guid);
        Ok(())
    }

    /// Stop sharing everything; returns how many bindings were removed
    pub fn unbind_all(&self) -> Result<usize> {
        let mut state = self.state.lock().expect("registry lock");
        let count = state.devices.len();
        if count > 0 {
            state.devices.clear();
            self.persist(&state)?;
            info!("Unshared {} device(s)", count);
        }
        Ok(count)
    }

    /// Atomically claim a device for one client session
    ///
    /// This is the test-and-set that enforces single-attach exclusivity.
    pub fn mark_attached(
        &self,
        bus_id: BusId,
        client_addr: SocketAddr,
        session_id: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("registry lock");
        let Some((guid, device)) = state.by_bus_id(bus_id) else {
            return Err(RegistryError::NotShared(bus_id));
        };
        if let Some(attached) = &device.attached {
            debug!(
                "attach {} refused: already attached to {}",
                bus_id, attached.client_addr
            );
            return Err(RegistryError::AlreadyAttached(bus_id));
        }
        if let Some(device) = state.devices.get_mut(&guid) {
            device.attached = Some(AttachedTo {
                client_addr,
                session_id,
            });
        }
        self.persist(&state)?;
        info!("Device {} attached to {}", bus_id, client_addr);
        Ok(())
    }

    /// Release a device; succeeds whether or not it was attached
    pub fn mark_detached(&self, bus_id: BusId) -> Result<()> {
        let mut state = self.state.lock().expect("registry lock");
        let Some((guid, device)) = state.by_bus_id(bus_id) else {
            // Unbound while attached; nothing to release.
            return Ok(());
        };
        if device.attached.is_none() {
            return Ok(());
        }
        if let Some(device) = state.devices.get_mut(&guid) {
            device.attached = None;
        }
        self.persist(&state)?;
        info!("Device {} detached", bus_id);
        Ok(())
    }

    /// Whether a bus id is currently shared
    pub fn is_shared(&self, bus_id: BusId) -> bool {
        self.state
            .lock()
            .expect("registry lock")
            .by_bus_id(bus_id)
            .is_some()
    }

    /// Every shared device, ordered by bus id
    pub fn list_shared(&self) -> Vec<SharedDevice> {
        let state = self.state.lock().expect("registry lock");
        let mut devices: Vec<SharedDevice> = state.devices.values().cloned().collect();
        devices.sort_by_key(|d| d.bus_id);
        devices
    }

    /// Shared devices whose bus id has no currently connected counterpart
    pub fn list_persisted(&self, connected: &[BusId]) -> Vec<SharedDevice> {
        self.list_shared()
            .into_iter()
            .filter(|d| !connected.contains(&d.bus_id))
            .collect()
    }

    fn persist(&self, state: &RegistryFile) -> Result<()> {
        let text = toml::to_string_pretty(state).map_err(|e| RegistryError::Store(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(e, parent))?;
        }

        // Write-then-rename so a crash never leaves a torn file.
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, text).map_err(|e| io_error(e, &tmp))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_error(e, &self.path))?;
        Ok(())
    }
}

fn io_error(e: std::io::Error, path: &Path) -> RegistryError {
    if e.kind() == ErrorKind::PermissionDenied {
        warn!("Registry access denied at {}", path.display());
        RegistryError::AccessDenied(path.to_path_buf())
    } else {
        RegistryError::Store(format!("{}: {}", path.display(), e))
    }
}
