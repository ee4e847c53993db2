//! Async channel bridge between the Tokio runtime and USB worker threads
//!
//! URB execution blocks on kernel I/O, so it runs on dedicated per-endpoint
//! threads. The bridge pairs an async sender (used by the attached session's
//! reader) with a blocking receiver (owned by the worker thread); the bounded
//! queue is what carries backpressure across the sync/async boundary.

use async_channel::{Receiver, Sender, bounded};
use protocol::{Direction, IsoPacket, UsbStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// How a URB reaches the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Endpoint 0 with a setup packet
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// One URB on its way to the device
///
/// Built by the attached session from a CMD_SUBMIT frame and consumed by an
/// endpoint worker. The cancel flag is shared with the session so an unlink
/// can stop a queued URB before it reaches the bus.
#[derive(Debug)]
pub struct UrbDispatch {
    pub seqnum: u32,
    /// Endpoint number without the direction bit (0..=15)
    pub endpoint: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    /// Setup packet, meaningful for control transfers only
    pub setup: [u8; 8],
    /// Data to send for OUT transfers; empty for IN
    pub payload: Vec<u8>,
    /// Requested buffer size for IN transfers
    pub buffer_length: usize,
    pub start_frame: i32,
    pub interval: i32,
    /// Descriptor vector for isochronous URBs
    pub iso_packets: Vec<IsoPacket>,
    cancelled: Arc<AtomicBool>,
}

impl UrbDispatch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        seqnum: u32,
        endpoint: u8,
        direction: Direction,
        kind: TransferKind,
        setup: [u8; 8],
        payload: Vec<u8>,
        buffer_length: usize,
        start_frame: i32,
        interval: i32,
        iso_packets: Vec<IsoPacket>,
    ) -> (Self, Arc<AtomicBool>) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let dispatch = Self {
            seqnum,
            endpoint,
            direction,
            kind,
            setup,
            payload,
            buffer_length,
            start_frame,
            interval,
            iso_packets,
            cancelled: cancelled.clone(),
        };
        (dispatch, cancelled)
    }

    /// Whether an unlink flagged this URB before execution started
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Endpoint address with the direction bit, as the USB stack expects it
    pub fn endpoint_address(&self) -> u8 {
        match self.direction {
            Direction::In => self.endpoint | 0x80,
            Direction::Out => self.endpoint,
        }
    }
}

/// Result of a URB, produced by an endpoint worker
#[derive(Debug, Clone)]
pub struct UrbCompletion {
    pub seqnum: u32,
    pub endpoint: u8,
    pub direction: Direction,
    pub status: UsbStatus,
    /// Data read for IN transfers; for iso, all packet buffers back-to-back
    pub data: Vec<u8>,
    pub actual_length: usize,
    pub start_frame: i32,
    pub error_count: i32,
    pub iso_packets: Vec<IsoPacket>,
}

impl UrbCompletion {
    /// Completion for a URB that never reached the bus
    pub fn aborted(urb: &UrbDispatch, status: UsbStatus) -> Self {
        Self {
            seqnum: urb.seqnum,
            endpoint: urb.endpoint,
            direction: urb.direction,
            status,
            data: Vec::new(),
            actual_length: 0,
            start_frame: urb.start_frame,
            error_count: 0,
            iso_packets: Vec::new(),
        }
    }
}

/// Async side of an endpoint queue
#[derive(Clone)]
pub struct EndpointSender {
    endpoint: u8,
    direction: Direction,
    tx: Sender<UrbDispatch>,
}

impl EndpointSender {
    /// Queue a URB for the worker; waits while the queue is full
    pub async fn submit(&self, urb: UrbDispatch) -> crate::Result<()> {
        self.tx
            .send(urb)
            .await
            .map_err(|_| crate::Error::EndpointClosed {
                endpoint: self.endpoint,
                direction: self.direction,
            })
    }

    /// Close the queue, stopping the worker after it drains
    pub fn close(&self) {
        self.tx.close();
    }
}

/// Blocking side of an endpoint queue, owned by the worker thread
pub struct EndpointWorker {
    endpoint: u8,
    direction: Direction,
    rx: Receiver<UrbDispatch>,
}

impl EndpointWorker {
    /// Receive the next URB; returns Err when the queue is closed and empty
    pub fn recv_blocking(&self) -> crate::Result<UrbDispatch> {
        self.rx
            .recv_blocking()
            .map_err(|_| crate::Error::EndpointClosed {
                endpoint: self.endpoint,
                direction: self.direction,
            })
    }
}

/// Create the bounded queue between the session and one endpoint worker
pub fn endpoint_queue(
    endpoint: u8,
    direction: Direction,
    depth: usize,
) -> (EndpointSender, EndpointWorker) {
    let (tx, rx) = bounded(depth);
    (
        EndpointSender {
            endpoint,
            direction,
            tx,
        },
        EndpointWorker {
            endpoint,
            direction,
            rx,
        },
    )
}
