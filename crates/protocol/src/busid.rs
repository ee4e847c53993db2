//! Bus identifiers
//!
//! A device on the host topology is addressed as `"<bus>-<port>"`, both
//! components 1-based. The 32-bit wire form packs the pair as
//! `(bus << 16) | port` and appears in the `devid` field of URB headers and
//! the `busnum`/`devnum` fields of device records.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Host topology address of a USB device
///
/// Ordered lexicographically by `(bus, port)`. Both components are 1-based;
/// parsing rejects zero and anything that does not fit a `u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusId {
    pub bus: u16,
    pub port: u16,
}

impl BusId {
    /// Length of the NUL-padded busid field in import requests and device
    /// records
    pub const FIELD_LEN: usize = 32;

    /// Create a bus id, rejecting zero components
    pub fn new(bus: u16, port: u16) -> Result<Self> {
        if bus == 0 || port == 0 {
            return Err(ProtocolError::InvalidBusId(format!("{bus}-{port}")));
        }
        Ok(Self { bus, port })
    }

    /// The 32-bit composite used in URB `devid` fields
    pub fn device_id(&self) -> DeviceId {
        DeviceId(((self.bus as u32) << 16) | self.port as u32)
    }

    /// Render as the NUL-padded 32-byte wire field
    pub fn to_field(&self) -> [u8; Self::FIELD_LEN] {
        let mut field = [0u8; Self::FIELD_LEN];
        let text = self.to_string();
        field[..text.len()].copy_from_slice(text.as_bytes());
        field
    }

    /// Parse a NUL-padded wire field back into a bus id
    pub fn from_field(field: &[u8]) -> Result<Self> {
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        let text = std::str::from_utf8(&field[..end])
            .map_err(|_| ProtocolError::InvalidBusId(format!("{:02x?}", &field[..end])))?;
        text.parse()
    }

    /// The sysfs-style path advertised in device records
    pub fn sysfs_path(&self) -> String {
        format!("/sys/bus/usb/devices/{self}")
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.bus, self.port)
    }
}

impl FromStr for BusId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ProtocolError::InvalidBusId(s.to_string());
        let (bus, port) = s.split_once('-').ok_or_else(invalid)?;
        let bus: u16 = bus.parse().map_err(|_| invalid())?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        Self::new(bus, port).map_err(|_| invalid())
    }
}

impl Serialize for BusId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BusId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Wire-visible 32-bit device identifier derived from a [`BusId`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Bus component (upper 16 bits)
    pub fn bus(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Port component (lower 16 bits)
    pub fn port(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Recover the bus id; fails on zero components
    pub fn bus_id(&self) -> Result<BusId> {
        BusId::new(self.bus(), self.port())
    }
}

impl From<BusId> for DeviceId {
    fn from(bus_id: BusId) -> Self {
        bus_id.device_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_render_roundtrip() {
        for text in ["1-1", "3-4", "12-2", "65535-65535"] {
            let bus_id: BusId = text.parse().unwrap();
            assert_eq!(bus_id.to_string(), text);
        }
    }

    #[test]
    fn test_parse_rejects_zero_components() {
        assert!("0-1".parse::<BusId>().is_err());
        assert!("1-0".parse::<BusId>().is_err());
        assert!("0-0".parse::<BusId>().is_err());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("".parse::<BusId>().is_err());
        assert!("3".parse::<BusId>().is_err());
        assert!("3-".parse::<BusId>().is_err());
        assert!("-4".parse::<BusId>().is_err());
        assert!("3-4-5".parse::<BusId>().is_err());
        assert!("a-b".parse::<BusId>().is_err());
        assert!("70000-1".parse::<BusId>().is_err()); // overflows u16
    }

    #[test]
    fn test_device_id_packing() {
        let bus_id = BusId::new(3, 4).unwrap();
        let devid = bus_id.device_id();
        assert_eq!(devid.0, 0x0003_0004);
        assert_eq!(devid.bus(), 3);
        assert_eq!(devid.port(), 4);
        assert_eq!(devid.bus_id().unwrap(), bus_id);
    }

    #[test]
    fn test_field_roundtrip() {
        let bus_id = BusId::new(12, 7).unwrap();
        let field = bus_id.to_field();
        assert_eq!(field.len(), BusId::FIELD_LEN);
        assert_eq!(&field[..4], b"12-7");
        assert!(field[4..].iter().all(|&b| b == 0));
        assert_eq!(BusId::from_field(&field).unwrap(), bus_id);
    }

    #[test]
    fn test_ordering() {
        let a = BusId::new(1, 9).unwrap();
        let b = BusId::new(2, 1).unwrap();
        let c = BusId::new(2, 3).unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_sysfs_path() {
        let bus_id = BusId::new(3, 4).unwrap();
        assert_eq!(bus_id.sysfs_path(), "/sys/bus/usb/devices/3-4");
    }
}
