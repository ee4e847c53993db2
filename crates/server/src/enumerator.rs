//! Device enumeration
//!
//! Read-only snapshots of currently connected USB devices, keyed by bus id
//! and stable-sorted. Enumeration races with hot-unplug by design: a device
//! that disappears mid-snapshot is silently omitted, never an error.

use common::test_utils::create_mock_export;
use protocol::{BusId, ExportedDevice, InterfaceDesc, Speed};
use rusb::UsbContext;
use std::sync::Mutex;
use tracing::{debug, trace};

/// A connected device plus its human-readable description
///
/// Descriptions require opening the device to read string descriptors, which
/// is comparatively expensive; callers opt in per snapshot.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub export: ExportedDevice,
    pub description: Option<String>,
}

/// Snapshot provider over the connected USB devices
pub trait DeviceEnumerator: Send + Sync {
    /// List connected devices, sorted by bus id
    fn list_connected(&self, with_descriptions: bool) -> Vec<DiscoveredDevice>;
}

/// Find a connected device by bus id
pub fn find_connected(
    enumerator: &dyn DeviceEnumerator,
    bus_id: BusId,
    with_descriptions: bool,
) -> Option<DiscoveredDevice> {
    enumerator
        .list_connected(with_descriptions)
        .into_iter()
        .find(|d| d.export.bus_id == bus_id)
}

/// rusb-backed enumerator
pub struct UsbEnumerator {
    context: rusb::Context,
}

impl UsbEnumerator {
    pub fn new() -> rusb::Result<Self> {
        Ok(Self {
            context: rusb::Context::new()?,
        })
    }

    fn snapshot(
        device: &rusb::Device<rusb::Context>,
        with_description: bool,
    ) -> Option<DiscoveredDevice> {
        // Root hubs and devices without a port address cannot be shared.
        let bus_id = BusId::new(device.bus_number() as u16, device.port_number() as u16).ok()?;
        let descriptor = device.device_descriptor().ok()?;

        let (configuration_value, interfaces) = match device.active_config_descriptor() {
            Ok(config) => {
                let interfaces = config
                    .interfaces()
                    .filter_map(|iface| iface.descriptors().next())
                    .map(|desc| InterfaceDesc {
                        class: desc.class_code(),
                        subclass: desc.sub_class_code(),
                        protocol: desc.protocol_code(),
                    })
                    .collect();
                (config.number(), interfaces)
            }
            // Unconfigured device; still exportable.
            Err(_) => (0, Vec::new()),
        };

        let export = ExportedDevice {
            bus_id,
            speed: map_speed(device.speed()),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            bcd_device: bcd16(descriptor.device_version()),
            device_class: descriptor.class_code(),
            device_subclass: descriptor.sub_class_code(),
            device_protocol: descriptor.protocol_code(),
            configuration_value,
            num_configurations: descriptor.num_configurations(),
            interfaces,
        };

        let description = if with_description {
            device.open().ok().and_then(|handle| {
                let product = handle.read_product_string_ascii(&descriptor).ok();
                let manufacturer = handle.read_manufacturer_string_ascii(&descriptor).ok();
                match (manufacturer, product) {
                    (Some(m), Some(p)) => Some(format!("{m} {p}")),
                    (_, Some(p)) => Some(p),
                    (Some(m), _) => Some(m),
                    _ => None,
                }
            })
        } else {
            None
        };

        Some(DiscoveredDevice {
            export,
            description,
        })
    }
}

impl DeviceEnumerator for UsbEnumerator {
    fn list_connected(&self, with_descriptions: bool) -> Vec<DiscoveredDevice> {
        let devices = match self.context.devices() {
            Ok(devices) => devices,
            Err(e) => {
                debug!("USB enumeration failed: {}", e);
                return Vec::new();
            }
        };

        let mut discovered: Vec<DiscoveredDevice> = devices
            .iter()
            .filter_map(|d| Self::snapshot(&d, with_descriptions))
            .collect();
        discovered.sort_by_key(|d| d.export.bus_id);
        trace!("Enumerated {} device(s)", discovered.len());
        discovered
    }
}

fn bcd16(version: rusb::Version) -> u16 {
    ((version.major() as u16) << 8) | ((version.minor() as u16) << 4) | version.sub_minor() as u16
}

fn map_speed(speed: rusb::Speed) -> Speed {
    match speed {
        rusb::Speed::Low => Speed::Low,
        rusb::Speed::Full => Speed::Full,
        rusb::Speed::High => Speed::High,
        rusb::Speed::Super => Speed::Super,
        rusb::Speed::SuperPlus => Speed::SuperPlus,
        _ => Speed::Unknown,
    }
}

/// Fixed-list enumerator for tests
///
/// Devices can be added and removed at runtime to exercise hot-unplug races.
#[derive(Default)]
pub struct MockEnumerator {
    devices: Mutex<Vec<DiscoveredDevice>>,
}

impl MockEnumerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enumerator pre-populated with one mock device per bus id
    pub fn with_devices(bus_ids: &[BusId]) -> Self {
        let enumerator = Self::new();
        for (i, bus_id) in bus_ids.iter().enumerate() {
            enumerator.add(DiscoveredDevice {
                export: create_mock_export(bus_id.bus, bus_id.port, 0x1000 + i as u16, 0x2000),
                description: Some(format!("Mock device {bus_id}")),
            });
        }
        enumerator
    }

    pub fn add(&self, device: DiscoveredDevice) {
        let mut devices = self.devices.lock().expect("mock enumerator lock");
        devices.push(device);
        devices.sort_by_key(|d| d.export.bus_id);
    }

    /// Simulate unplugging a device
    pub fn remove(&self, bus_id: BusId) {
        self.devices
            .lock()
            .expect("mock enumerator lock")
            .retain(|d| d.export.bus_id != bus_id);
    }
}

impl DeviceEnumerator for MockEnumerator {
    fn list_connected(&self, _with_descriptions: bool) -> Vec<DiscoveredDevice> {
        self.devices.lock().expect("mock enumerator lock").clone()
    }
}
