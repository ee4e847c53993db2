//! Capture-driver adapter
//!
//! Wraps whatever actually talks to the kernel USB stack behind a small
//! surface: open a device, submit URBs, cancel by seqnum, reset, release.
//! This is the only part of the server allowed to block on kernel I/O, and
//! it does so on dedicated per-endpoint worker threads; everything above it
//! stays async.
//!
//! Per-endpoint FIFO ordering falls out of the construction: each endpoint
//! gets one bounded queue drained by one thread, so URBs reach the bus in
//! submission order per endpoint while distinct endpoints proceed
//! concurrently.

pub mod mock;
pub mod transfers;
pub mod usb;

pub use mock::MockDriver;
pub use usb::UsbCaptureDriver;

use common::{EndpointSender, UrbCompletion, UrbDispatch, endpoint_queue};
use protocol::{Direction, ExportedDevice, UsbStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Executes a single URB against the device, blocking until it settles
///
/// Implementations run on endpoint worker threads and must be callable from
/// several threads at once (one per endpoint).
pub trait UrbExecutor: Send + Sync + 'static {
    fn execute(&self, urb: &UrbDispatch) -> UrbCompletion;

    /// Port reset
    fn reset(&self) -> common::Result<()>;

    /// Give the device back to the host stack
    fn release(&self);
}

/// Captures devices from the host USB stack
pub trait CaptureDriver: Send + Sync {
    /// Detach `device` from the host and return a handle serving URBs
    ///
    /// Completions are delivered on `completions`; the channel closes once
    /// the device is released and all in-flight URBs have settled.
    fn open(
        &self,
        device: &ExportedDevice,
        completions: mpsc::Sender<UrbCompletion>,
    ) -> common::Result<CapturedDevice>;
}

/// A device captured for one attached session
///
/// Owned exclusively by that session; dropped (after
/// [`release`](Self::release)) when the session ends.
pub struct CapturedDevice {
    exported: ExportedDevice,
    executor: Arc<dyn UrbExecutor>,
    queue_depth: usize,
    completions: Mutex<Option<mpsc::Sender<UrbCompletion>>>,
    endpoints: Mutex<HashMap<(u8, Direction), EndpointSender>>,
    inflight: Arc<Mutex<HashMap<u32, Arc<AtomicBool>>>>,
}

impl CapturedDevice {
    pub fn new(
        exported: ExportedDevice,
        executor: Arc<dyn UrbExecutor>,
        completions: mpsc::Sender<UrbCompletion>,
        queue_depth: usize,
    ) -> Self {
        Self {
            exported,
            executor,
            queue_depth,
            completions: Mutex::new(Some(completions)),
            endpoints: Mutex::new(HashMap::new()),
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The enumeration view this device was opened from
    pub fn exported(&self) -> &ExportedDevice {
        &self.exported
    }

    /// Queue a URB on its endpoint; waits while that endpoint's queue is full
    pub async fn submit(
        &self,
        urb: UrbDispatch,
        cancel: Arc<AtomicBool>,
    ) -> common::Result<()> {
        let sender = self.endpoint_sender(urb.endpoint, urb.direction)?;
        let seqnum = urb.seqnum;
        self.inflight
            .lock()
            .expect("inflight lock")
            .insert(seqnum, cancel);
        trace!(
            "submit seqnum={} ep={} dir={:?}",
            seqnum, urb.endpoint, urb.direction
        );
        if let Err(e) = sender.submit(urb).await {
            self.inflight.lock().expect("inflight lock").remove(&seqnum);
            return Err(e);
        }
        Ok(())
    }

    /// Flag a URB for cancellation; true if it had not yet settled
    ///
    /// A URB already on the bus cannot be aborted; its completion is simply
    /// dropped by the session once the context is gone.
    pub fn cancel(&self, seqnum: u32) -> bool {
        let inflight = self.inflight.lock().expect("inflight lock");
        match inflight.get(&seqnum) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                debug!("cancelled seqnum={}", seqnum);
                true
            }
            None => false,
        }
    }

    /// Port-reset the device
    pub fn reset(&self) -> common::Result<()> {
        self.executor.reset()
    }

    /// Stop accepting URBs and give the device back to the host
    ///
    /// Endpoint queues close, workers drain and exit, and the completion
    /// channel closes once the last worker finishes.
    pub fn release(&self) {
        let endpoints = self.endpoints.lock().expect("endpoint lock");
        for sender in endpoints.values() {
            sender.close();
        }
        drop(endpoints);
        // Drop our completion sender so the channel closes with the workers.
        self.completions.lock().expect("completion lock").take();
        self.executor.release();
        debug!("released device {}", self.exported.bus_id);
    }

    fn endpoint_sender(&self, endpoint: u8, direction: Direction) -> common::Result<EndpointSender> {
        let mut endpoints = self.endpoints.lock().expect("endpoint lock");
        if let Some(sender) = endpoints.get(&(endpoint, direction)) {
            return Ok(sender.clone());
        }

        let completions = self
            .completions
            .lock()
            .expect("completion lock")
            .clone()
            .ok_or(common::Error::DeviceGone(self.exported.bus_id))?;

        let (sender, worker) = endpoint_queue(endpoint, direction, self.queue_depth);
        let executor = self.executor.clone();
        let inflight = self.inflight.clone();
        let name = format!(
            "urb-{}-ep{}{}",
            self.exported.bus_id,
            endpoint,
            match direction {
                Direction::In => "i",
                Direction::Out => "o",
            }
        );
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                while let Ok(urb) = worker.recv_blocking() {
                    let completion = if urb.is_cancelled() {
                        UrbCompletion::aborted(&urb, UsbStatus::Cancelled)
                    } else {
                        executor.execute(&urb)
                    };
                    inflight
                        .lock()
                        .expect("inflight lock")
                        .remove(&urb.seqnum);
                    if completions.blocking_send(completion).is_err() {
                        // Session is gone; stop draining.
                        break;
                    }
                }
            })
            .map_err(|e| common::Error::Capture {
                bus_id: self.exported.bus_id,
                reason: format!("failed to spawn endpoint worker: {e}"),
            })?;

        endpoints.insert((endpoint, direction), sender.clone());
        Ok(sender)
    }
}

impl Drop for CapturedDevice {
    fn drop(&mut self) {
        let released = self
            .completions
            .lock()
            .map(|c| c.is_none())
            .unwrap_or(true);
        if !released {
            warn!(
                "device {} dropped without release",
                self.exported.bus_id
            );
            self.release();
        }
    }
}
