//! Test utilities for usbip-share
//!
//! Mock device fixtures and helpers shared by unit and integration tests
//! across the workspace.

use protocol::{BusId, ExportedDevice, InterfaceDesc, Speed};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock exported device at the given topology address
pub fn create_mock_export(bus: u16, port: u16, vendor_id: u16, product_id: u16) -> ExportedDevice {
    ExportedDevice {
        bus_id: BusId::new(bus, port).expect("valid test bus id"),
        speed: Speed::High,
        vendor_id,
        product_id,
        bcd_device: 0x0100,
        device_class: 0x00,
        device_subclass: 0x00,
        device_protocol: 0x00,
        configuration_value: 1,
        num_configurations: 1,
        interfaces: vec![InterfaceDesc {
            class: 0xff,
            subclass: 0x00,
            protocol: 0x00,
        }],
    }
}

/// Create a mock mass storage device (bulk-only SCSI)
pub fn create_mock_storage_export(bus: u16, port: u16) -> ExportedDevice {
    let mut device = create_mock_export(bus, port, 0x0781, 0x5581);
    device.speed = Speed::Super;
    device.interfaces = vec![InterfaceDesc {
        class: 0x08,
        subclass: 0x06,
        protocol: 0x50,
    }];
    device
}

/// Create a mock HID device (keyboard)
pub fn create_mock_hid_export(bus: u16, port: u16) -> ExportedDevice {
    let mut device = create_mock_export(bus, port, 0x046d, 0xc52b);
    device.speed = Speed::Full;
    device.interfaces = vec![InterfaceDesc {
        class: 0x03,
        subclass: 0x01,
        protocol: 0x01,
    }];
    device
}

/// A standard 18-byte device descriptor, as GET_DESCRIPTOR(Device) returns it
pub fn create_mock_device_descriptor() -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        0x34, 0x12, // idVendor (0x1234)
        0x78, 0x56, // idProduct (0x5678)
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Build a control setup packet
pub fn create_setup_packet(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> [u8; 8] {
    [
        request_type,
        request,
        (value & 0xff) as u8,
        (value >> 8) as u8,
        (index & 0xff) as u8,
        (index >> 8) as u8,
        (length & 0xff) as u8,
        (length >> 8) as u8,
    ]
}

/// The GET_DESCRIPTOR(Device, 18 bytes) setup packet
pub fn get_device_descriptor_setup() -> [u8; 8] {
    create_setup_packet(0x80, 0x06, 0x0100, 0x0000, 0x0012)
}

/// Timeout wrapper for async tests
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
