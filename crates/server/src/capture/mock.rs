//! Scriptable in-memory capture driver
//!
//! Stands in for the kernel driver in tests: answers GET_DESCRIPTOR on
//! endpoint 0, loops back bulk traffic with a configurable delay, and can be
//! told to stall endpoints. Used by the integration suite and handy for
//! driving the server without hardware.

use super::{CaptureDriver, CapturedDevice, UrbExecutor};
use common::test_utils::create_mock_device_descriptor;
use common::{TransferKind, UrbCompletion, UrbDispatch};
use protocol::{Direction, ExportedDevice, IsoPacket, UsbStatus};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const GET_DESCRIPTOR: u8 = 0x06;

/// Mock capture driver
#[derive(Clone, Default)]
pub struct MockDriver {
    /// Delay applied to every bulk transfer before it settles
    pub bulk_delay: Duration,
    /// Endpoints (without direction bit) that answer every URB with a stall
    pub stalled_endpoints: HashSet<u8>,
    /// Per-endpoint queue depth handed to the captured device
    pub queue_depth: usize,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            bulk_delay: Duration::ZERO,
            stalled_endpoints: HashSet::new(),
            queue_depth: 32,
        }
    }

    pub fn with_bulk_delay(mut self, delay: Duration) -> Self {
        self.bulk_delay = delay;
        self
    }

    pub fn with_stalled_endpoint(mut self, endpoint: u8) -> Self {
        self.stalled_endpoints.insert(endpoint);
        self
    }
}

impl CaptureDriver for MockDriver {
    fn open(
        &self,
        device: &ExportedDevice,
        completions: mpsc::Sender<UrbCompletion>,
    ) -> common::Result<CapturedDevice> {
        let executor = MockExecutor {
            descriptor: create_mock_device_descriptor(),
            bulk_delay: self.bulk_delay,
            stalled_endpoints: self.stalled_endpoints.clone(),
        };
        Ok(CapturedDevice::new(
            device.clone(),
            Arc::new(executor),
            completions,
            self.queue_depth.max(1),
        ))
    }
}

struct MockExecutor {
    descriptor: Vec<u8>,
    bulk_delay: Duration,
    stalled_endpoints: HashSet<u8>,
}

impl MockExecutor {
    fn done(urb: &UrbDispatch, status: UsbStatus, data: Vec<u8>) -> UrbCompletion {
        let actual = data.len().max(if urb.direction == Direction::Out {
            urb.payload.len()
        } else {
            0
        });
        UrbCompletion {
            seqnum: urb.seqnum,
            endpoint: urb.endpoint,
            direction: urb.direction,
            status,
            actual_length: if status.is_ok() { actual } else { 0 },
            data: if status.is_ok() { data } else { Vec::new() },
            start_frame: urb.start_frame,
            error_count: 0,
            iso_packets: Vec::new(),
        }
    }
}

impl UrbExecutor for MockExecutor {
    fn execute(&self, urb: &UrbDispatch) -> UrbCompletion {
        if self.stalled_endpoints.contains(&urb.endpoint) {
            return Self::done(urb, UsbStatus::Stall, Vec::new());
        }

        match urb.kind {
            TransferKind::Control => {
                if urb.direction == Direction::In && urb.setup[1] == GET_DESCRIPTOR {
                    let wanted = urb.buffer_length.min(self.descriptor.len());
                    Self::done(urb, UsbStatus::Ok, self.descriptor[..wanted].to_vec())
                } else {
                    Self::done(urb, UsbStatus::Ok, Vec::new())
                }
            }
            TransferKind::Bulk => {
                if !self.bulk_delay.is_zero() {
                    std::thread::sleep(self.bulk_delay);
                }
                if urb.direction == Direction::In {
                    let data: Vec<u8> =
                        (0..urb.buffer_length).map(|i| (i & 0xff) as u8).collect();
                    Self::done(urb, UsbStatus::Ok, data)
                } else {
                    Self::done(urb, UsbStatus::Ok, Vec::new())
                }
            }
            TransferKind::Interrupt => {
                if urb.direction == Direction::In {
                    Self::done(urb, UsbStatus::Ok, vec![0u8; urb.buffer_length.min(8)])
                } else {
                    Self::done(urb, UsbStatus::Ok, Vec::new())
                }
            }
            TransferKind::Isochronous => {
                let is_in = urb.direction == Direction::In;
                let iso_packets: Vec<IsoPacket> = urb
                    .iso_packets
                    .iter()
                    .map(|p| IsoPacket {
                        offset: p.offset,
                        length: p.length,
                        actual_length: p.length,
                        status: 0,
                    })
                    .collect();
                let data = if is_in {
                    vec![0x55u8; urb.buffer_length]
                } else {
                    Vec::new()
                };
                let mut done = Self::done(urb, UsbStatus::Ok, data);
                done.actual_length = if is_in {
                    urb.buffer_length
                } else {
                    urb.payload.len()
                };
                done.iso_packets = iso_packets;
                done
            }
        }
    }

    fn reset(&self) -> common::Result<()> {
        Ok(())
    }

    fn release(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_mock_storage_export, get_device_descriptor_setup};

    fn open_mock(driver: &MockDriver) -> (CapturedDevice, mpsc::Receiver<UrbCompletion>) {
        let (tx, rx) = mpsc::channel(16);
        let device = driver
            .open(&create_mock_storage_export(3, 4), tx)
            .unwrap();
        (device, rx)
    }

    #[tokio::test]
    async fn test_control_get_descriptor() {
        let (device, mut rx) = open_mock(&MockDriver::new());

        let (urb, cancel) = UrbDispatch::new(
            1,
            0,
            Direction::In,
            TransferKind::Control,
            get_device_descriptor_setup(),
            Vec::new(),
            18,
            0,
            0,
            Vec::new(),
        );
        device.submit(urb, cancel).await.unwrap();

        let done = rx.recv().await.unwrap();
        assert_eq!(done.seqnum, 1);
        assert_eq!(done.status, UsbStatus::Ok);
        assert_eq!(done.actual_length, 18);
        assert_eq!(&done.data[..2], &[0x12, 0x01]);

        device.release();
    }

    #[tokio::test]
    async fn test_cancel_flags_queued_urb() {
        let driver = MockDriver::new().with_bulk_delay(Duration::from_millis(50));
        let (device, mut rx) = open_mock(&driver);

        // First URB occupies the endpoint worker; second sits in the queue.
        for seqnum in [1, 2] {
            let (urb, cancel) = UrbDispatch::new(
                seqnum,
                1,
                Direction::In,
                TransferKind::Bulk,
                [0u8; 8],
                Vec::new(),
                512,
                0,
                0,
                Vec::new(),
            );
            device.submit(urb, cancel).await.unwrap();
        }
        assert!(device.cancel(2));
        assert!(!device.cancel(99));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.seqnum, 1);
        assert_eq!(first.status, UsbStatus::Ok);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.seqnum, 2);
        assert_eq!(second.status, UsbStatus::Cancelled);

        device.release();
    }

    #[tokio::test]
    async fn test_release_closes_completion_channel() {
        let (device, mut rx) = open_mock(&MockDriver::new());

        let (urb, cancel) = UrbDispatch::new(
            1,
            2,
            Direction::Out,
            TransferKind::Bulk,
            [0u8; 8],
            vec![0xaa; 64],
            64,
            0,
            0,
            Vec::new(),
        );
        device.submit(urb, cancel).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().seqnum, 1);

        device.release();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stalled_endpoint() {
        let driver = MockDriver::new().with_stalled_endpoint(1);
        let (device, mut rx) = open_mock(&driver);

        let (urb, cancel) = UrbDispatch::new(
            4,
            1,
            Direction::In,
            TransferKind::Bulk,
            [0u8; 8],
            Vec::new(),
            512,
            0,
            0,
            Vec::new(),
        );
        device.submit(urb, cancel).await.unwrap();

        let done = rx.recv().await.unwrap();
        assert_eq!(done.status, UsbStatus::Stall);
        assert_eq!(done.actual_length, 0);

        device.release();
    }
}
