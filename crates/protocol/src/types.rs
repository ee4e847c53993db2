//! Device description types
//!
//! The enumeration view of a connected USB device as it appears in device
//! list and import replies. These types carry exactly the fields the wire
//! format needs; richer host-side state (descriptions, driver handles) lives
//! with the server.

use crate::busid::{BusId, DeviceId};
use crate::error::{ProtocolError, Result};

/// USB device speed, numbered per the Linux `usb_device_speed` enum
///
/// The numeric values go on the wire in device records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Speed {
    Unknown = 0,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low = 1,
    /// Full speed - 12 Mbps (USB 1.1)
    Full = 2,
    /// High speed - 480 Mbps (USB 2.0)
    High = 3,
    /// Wireless USB
    Wireless = 4,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super = 5,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus = 6,
}

impl Speed {
    /// Wire representation
    pub fn to_wire(self) -> u32 {
        self as u32
    }

    /// Decode the wire representation
    pub fn from_wire(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Speed::Unknown),
            1 => Ok(Speed::Low),
            2 => Ok(Speed::Full),
            3 => Ok(Speed::High),
            4 => Ok(Speed::Wireless),
            5 => Ok(Speed::Super),
            6 => Ok(Speed::SuperPlus),
            other => Err(ProtocolError::InvalidSpeed(other)),
        }
    }
}

/// One interface of the active configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDesc {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// The enumeration view of a connected device
///
/// Produced on demand by the device enumerator and serialized into device
/// list and import replies. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedDevice {
    pub bus_id: BusId,
    pub speed: Speed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub interfaces: Vec<InterfaceDesc>,
}

impl ExportedDevice {
    /// Wire-visible device identifier
    pub fn device_id(&self) -> DeviceId {
        self.bus_id.device_id()
    }
}
