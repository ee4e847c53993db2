//! Setup-phase operation frames
//!
//! Before a connection enters attached mode it speaks the operation protocol:
//! an 8-byte common header followed by an op-specific body. The server
//! answers `OP_REQ_DEVLIST` with the device list reply and `OP_REQ_IMPORT`
//! with an import reply; on a successful import the connection switches to
//! the URB protocol in [`crate::urb`].

use crate::busid::BusId;
use crate::error::{ProtocolError, Result};
use crate::types::{ExportedDevice, InterfaceDesc, Speed};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Protocol version word carried in every common header
pub const USBIP_VERSION: u16 = 0x0111;

/// Device list operation code (request and reply)
pub const OP_DEVLIST: u16 = 0x8005;

/// Import operation code (request and reply)
pub const OP_IMPORT: u16 = 0x8003;

/// Status value for a successful reply
pub const OP_STATUS_OK: u32 = 0;

/// Status value for a failed reply
pub const OP_STATUS_ERROR: u32 = 1;

/// Fixed part of a device record, before the interface tuples
pub const DEVICE_RECORD_SIZE: usize = 0x138;

const PATH_FIELD_LEN: usize = 256;

/// Common 8-byte request/reply header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

impl OpHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 8;

    /// Build a request header (status is unused in requests)
    pub fn request(code: u16) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status: 0,
        }
    }

    /// Build a reply header
    pub fn reply(code: u16, status: u32) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status,
        }
    }

    /// Read a header from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u16::<BigEndian>()?;
        let code = reader.read_u16::<BigEndian>()?;
        let status = reader.read_u32::<BigEndian>()?;
        Ok(Self {
            version,
            code,
            status,
        })
    }

    /// Write the header to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.version)?;
        writer.write_u16::<BigEndian>(self.code)?;
        writer.write_u32::<BigEndian>(self.status)?;
        Ok(())
    }

    /// Check the version word against [`USBIP_VERSION`]
    pub fn check_version(&self) -> Result<()> {
        if self.version != USBIP_VERSION {
            return Err(ProtocolError::VersionMismatch {
                got: self.version,
                expected: USBIP_VERSION,
            });
        }
        Ok(())
    }
}

/// Read the 32-byte busid field of an import request
pub fn read_import_busid<R: Read>(reader: &mut R) -> Result<BusId> {
    let mut field = [0u8; BusId::FIELD_LEN];
    reader.read_exact(&mut field)?;
    BusId::from_field(&field)
}

/// Write a complete import request (header plus busid field)
pub fn write_import_request<W: Write>(writer: &mut W, bus_id: BusId) -> Result<()> {
    OpHeader::request(OP_IMPORT).write_to(writer)?;
    writer.write_all(&bus_id.to_field())?;
    Ok(())
}

/// Write a device record
///
/// The fixed 0x138-byte body is followed by one 4-byte tuple per interface.
pub fn write_device_record<W: Write>(writer: &mut W, device: &ExportedDevice) -> Result<()> {
    let num_interfaces: u8 = device
        .interfaces
        .len()
        .try_into()
        .map_err(|_| ProtocolError::FieldOverflow {
            field: "bNumInterfaces",
        })?;

    let mut path = [0u8; PATH_FIELD_LEN];
    let text = device.bus_id.sysfs_path();
    path[..text.len()].copy_from_slice(text.as_bytes());
    writer.write_all(&path)?;
    writer.write_all(&device.bus_id.to_field())?;

    writer.write_u32::<BigEndian>(device.bus_id.bus as u32)?;
    writer.write_u32::<BigEndian>(device.bus_id.port as u32)?;
    writer.write_u32::<BigEndian>(device.speed.to_wire())?;
    writer.write_u16::<BigEndian>(device.vendor_id)?;
    writer.write_u16::<BigEndian>(device.product_id)?;
    writer.write_u16::<BigEndian>(device.bcd_device)?;
    writer.write_u8(device.device_class)?;
    writer.write_u8(device.device_subclass)?;
    writer.write_u8(device.device_protocol)?;
    writer.write_u8(device.configuration_value)?;
    writer.write_u8(device.num_configurations)?;
    writer.write_u8(num_interfaces)?;

    for iface in &device.interfaces {
        writer.write_u8(iface.class)?;
        writer.write_u8(iface.subclass)?;
        writer.write_u8(iface.protocol)?;
        writer.write_u8(0)?; // padding
    }

    Ok(())
}

/// Read a device record
pub fn read_device_record<R: Read>(reader: &mut R) -> Result<ExportedDevice> {
    let mut path = [0u8; PATH_FIELD_LEN];
    reader.read_exact(&mut path)?;

    let mut busid_field = [0u8; BusId::FIELD_LEN];
    reader.read_exact(&mut busid_field)?;
    let bus_id = BusId::from_field(&busid_field)?;

    let _busnum = reader.read_u32::<BigEndian>()?;
    let _devnum = reader.read_u32::<BigEndian>()?;
    let speed = Speed::from_wire(reader.read_u32::<BigEndian>()?)?;
    let vendor_id = reader.read_u16::<BigEndian>()?;
    let product_id = reader.read_u16::<BigEndian>()?;
    let bcd_device = reader.read_u16::<BigEndian>()?;
    let device_class = reader.read_u8()?;
    let device_subclass = reader.read_u8()?;
    let device_protocol = reader.read_u8()?;
    let configuration_value = reader.read_u8()?;
    let num_configurations = reader.read_u8()?;
    let num_interfaces = reader.read_u8()?;

    let mut interfaces = Vec::with_capacity(num_interfaces as usize);
    for _ in 0..num_interfaces {
        let class = reader.read_u8()?;
        let subclass = reader.read_u8()?;
        let protocol = reader.read_u8()?;
        let _padding = reader.read_u8()?;
        interfaces.push(InterfaceDesc {
            class,
            subclass,
            protocol,
        });
    }

    Ok(ExportedDevice {
        bus_id,
        speed,
        vendor_id,
        product_id,
        bcd_device,
        device_class,
        device_subclass,
        device_protocol,
        configuration_value,
        num_configurations,
        interfaces,
    })
}

/// Write a complete device list reply
pub fn write_devlist_reply<W: Write>(writer: &mut W, devices: &[ExportedDevice]) -> Result<()> {
    OpHeader::reply(OP_DEVLIST, OP_STATUS_OK).write_to(writer)?;
    let ndev: u32 = devices
        .len()
        .try_into()
        .map_err(|_| ProtocolError::FieldOverflow { field: "ndev" })?;
    writer.write_u32::<BigEndian>(ndev)?;
    for device in devices {
        write_device_record(writer, device)?;
    }
    Ok(())
}

/// Read the body of a device list reply (after the common header)
pub fn read_devlist_devices<R: Read>(reader: &mut R) -> Result<Vec<ExportedDevice>> {
    let ndev = reader.read_u32::<BigEndian>()?;
    let mut devices = Vec::with_capacity(ndev.min(1024) as usize);
    for _ in 0..ndev {
        devices.push(read_device_record(reader)?);
    }
    Ok(devices)
}

/// Write a successful import reply (header plus device record)
pub fn write_import_reply_ok<W: Write>(writer: &mut W, device: &ExportedDevice) -> Result<()> {
    OpHeader::reply(OP_IMPORT, OP_STATUS_OK).write_to(writer)?;
    write_device_record(writer, device)?;
    Ok(())
}

/// Write a failed import reply (no device record follows)
pub fn write_import_reply_err<W: Write>(writer: &mut W) -> Result<()> {
    OpHeader::reply(OP_IMPORT, OP_STATUS_ERROR).write_to(writer)?;
    Ok(())
}
