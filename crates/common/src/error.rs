//! Errors crossing the driver/session boundary
//!
//! Everything here names the device or endpoint it concerns; sessions log
//! these and decide between answering the peer with an errno status and
//! tearing the attachment down.

use protocol::{BusId, Direction};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The device is no longer reachable: unplugged, never present, or
    /// already released back to the host
    #[error("device {0} is gone")]
    DeviceGone(BusId),

    /// The local USB stack refused to capture or drive the device
    #[error("capture of {bus_id} failed: {reason}")]
    Capture { bus_id: BusId, reason: String },

    /// A URB was handed to an endpoint whose worker has stopped
    #[error("endpoint {endpoint} {direction:?} queue is closed")]
    EndpointClosed { endpoint: u8, direction: Direction },

    /// The log filter could not be built from the configured level
    #[error("invalid log filter {filter:?}: {reason}")]
    LogFilter { filter: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure means the attachment cannot continue
    ///
    /// A vanished device or a stopped endpoint worker ends the attachment;
    /// a refused operation is the caller's to judge.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(self, Error::DeviceGone(_) | Error::EndpointClosed { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
