//! Network layer
//!
//! The listener accepts connections on the USB/IP port and spawns a
//! [`client::ClientConnection`] per socket; a successful import hands the
//! socket to [`session`], the attached-mode URB pipeline.

pub mod client;
pub mod listener;
pub mod session;

pub use listener::Listener;
pub use session::SessionLimits;

use crate::capture::CaptureDriver;
use crate::enumerator::DeviceEnumerator;
use crate::pcap::CaptureSink;
use crate::registry::BindingRegistry;
use std::sync::Arc;

/// Services shared by every connection
pub struct ServerState {
    pub registry: Arc<BindingRegistry>,
    pub enumerator: Arc<dyn DeviceEnumerator>,
    pub driver: Arc<dyn CaptureDriver>,
    pub limits: SessionLimits,
    /// Expose all connected devices in DEVLIST instead of shared-only
    pub devlist_all: bool,
    pub sink: Option<CaptureSink>,
}
