//! rusb-backed capture driver
//!
//! Captures a device by opening it through libusb, detaching kernel drivers
//! where the platform supports it, and claiming every interface of the
//! active configuration. URB execution itself lives in
//! [`transfers`](super::transfers).

use super::transfers::execute_urb;
use super::{CaptureDriver, CapturedDevice, UrbExecutor};
use common::{UrbCompletion, UrbDispatch};
use protocol::ExportedDevice;
use rusb::{Context, DeviceHandle, UsbContext};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Opens devices through libusb
pub struct UsbCaptureDriver {
    context: Context,
    queue_depth: usize,
}

impl UsbCaptureDriver {
    pub fn new(queue_depth: usize) -> rusb::Result<Self> {
        Ok(Self {
            context: Context::new()?,
            queue_depth,
        })
    }
}

impl CaptureDriver for UsbCaptureDriver {
    fn open(
        &self,
        device: &ExportedDevice,
        completions: mpsc::Sender<UrbCompletion>,
    ) -> common::Result<CapturedDevice> {
        let bus_id = device.bus_id;
        let target = self
            .context
            .devices()
            .map_err(|e| common::Error::Capture {
                bus_id,
                reason: format!("enumeration failed: {e}"),
            })?
            .iter()
            .find(|d| d.bus_number() as u16 == bus_id.bus && d.port_number() as u16 == bus_id.port)
            .ok_or(common::Error::DeviceGone(bus_id))?;

        let mut handle = target.open().map_err(|e| common::Error::Capture {
            bus_id,
            reason: format!("open failed: {e}"),
        })?;

        // Let libusb steal interfaces from kernel drivers while we hold them.
        if handle.set_auto_detach_kernel_driver(true).is_err() {
            debug!("auto-detach not supported on this platform");
        }

        let mut claimed = Vec::new();
        for interface in 0..device.interfaces.len() as u8 {
            match handle.claim_interface(interface) {
                Ok(()) => claimed.push(interface),
                Err(e) => warn!("could not claim interface {} of {}: {}", interface, bus_id, e),
            }
        }
        if claimed.is_empty() && !device.interfaces.is_empty() {
            return Err(common::Error::Capture {
                bus_id,
                reason: "no interface could be claimed".into(),
            });
        }

        info!(
            "captured {} ({} interface(s) claimed)",
            bus_id,
            claimed.len()
        );

        // Transfers run concurrently under the read lock; reset and release
        // need libusb's exclusive calls and take the write lock.
        let executor = RusbExecutor {
            bus_id,
            handle: RwLock::new(handle),
            claimed,
        };
        Ok(CapturedDevice::new(
            device.clone(),
            Arc::new(executor),
            completions,
            self.queue_depth,
        ))
    }
}

struct RusbExecutor {
    bus_id: protocol::BusId,
    handle: RwLock<DeviceHandle<Context>>,
    claimed: Vec<u8>,
}

impl UrbExecutor for RusbExecutor {
    fn execute(&self, urb: &UrbDispatch) -> UrbCompletion {
        let handle = self.handle.read().expect("device handle lock");
        execute_urb(&handle, urb)
    }

    fn reset(&self) -> common::Result<()> {
        let mut handle = self.handle.write().expect("device handle lock");
        handle.reset().map_err(|e| match e {
            rusb::Error::NoDevice | rusb::Error::NotFound => {
                common::Error::DeviceGone(self.bus_id)
            }
            e => common::Error::Capture {
                bus_id: self.bus_id,
                reason: format!("reset failed: {e}"),
            },
        })
    }

    fn release(&self) {
        let mut handle = self.handle.write().expect("device handle lock");
        for interface in &self.claimed {
            if let Err(e) = handle.release_interface(*interface) {
                debug!("release interface {}: {}", interface, e);
            }
        }
    }
}
