//! URB execution against rusb
//!
//! Synchronous transfer functions run on endpoint worker threads. Each takes
//! a dispatched URB and produces the completion the session turns into a
//! RET_SUBMIT frame, with rusb errors mapped onto the wire status values.

use common::{TransferKind, UrbCompletion, UrbDispatch};
use protocol::{Direction, IsoPacket, UsbStatus};
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::{trace, warn};

/// Timeout for URBs that carry no interval of their own
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for interrupt IN polling
///
/// vhci-hcd re-submits interrupt IN URBs continuously; a bounded timeout
/// keeps the worker responsive to cancellation without losing HID events.
const INTERRUPT_IN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Execute one URB and build its completion
pub fn execute_urb(handle: &DeviceHandle<Context>, urb: &UrbDispatch) -> UrbCompletion {
    match urb.kind {
        TransferKind::Control => execute_control(handle, urb),
        TransferKind::Bulk => execute_bulk(handle, urb),
        TransferKind::Interrupt => execute_interrupt(handle, urb),
        TransferKind::Isochronous => execute_isochronous(urb),
    }
}

fn completion(urb: &UrbDispatch, status: UsbStatus, data: Vec<u8>, actual: usize) -> UrbCompletion {
    UrbCompletion {
        seqnum: urb.seqnum,
        endpoint: urb.endpoint,
        direction: urb.direction,
        status,
        data,
        actual_length: actual,
        start_frame: urb.start_frame,
        error_count: 0,
        iso_packets: Vec::new(),
    }
}

fn execute_control(handle: &DeviceHandle<Context>, urb: &UrbDispatch) -> UrbCompletion {
    let request_type = urb.setup[0];
    let request = urb.setup[1];
    let value = u16::from_le_bytes([urb.setup[2], urb.setup[3]]);
    let index = u16::from_le_bytes([urb.setup[4], urb.setup[5]]);

    trace!(
        "control seqnum={} request_type={:#04x} request={:#04x} value={:#06x} index={:#06x} len={}",
        urb.seqnum, request_type, request, value, index, urb.buffer_length
    );

    if urb.direction == Direction::In {
        let mut buffer = vec![0u8; urb.buffer_length];
        match handle.read_control(request_type, request, value, index, &mut buffer, DEFAULT_TIMEOUT)
        {
            Ok(len) => {
                buffer.truncate(len);
                completion(urb, UsbStatus::Ok, buffer, len)
            }
            Err(e) => {
                warn!("control IN seqnum={} failed: {}", urb.seqnum, e);
                completion(urb, map_rusb_error(e), Vec::new(), 0)
            }
        }
    } else {
        match handle.write_control(
            request_type,
            request,
            value,
            index,
            &urb.payload,
            DEFAULT_TIMEOUT,
        ) {
            Ok(len) => completion(urb, UsbStatus::Ok, Vec::new(), len),
            Err(e) => {
                warn!("control OUT seqnum={} failed: {}", urb.seqnum, e);
                completion(urb, map_rusb_error(e), Vec::new(), 0)
            }
        }
    }
}

fn execute_bulk(handle: &DeviceHandle<Context>, urb: &UrbDispatch) -> UrbCompletion {
    let endpoint = urb.endpoint_address();

    if urb.direction == Direction::In {
        let mut buffer = vec![0u8; urb.buffer_length];
        match handle.read_bulk(endpoint, &mut buffer, DEFAULT_TIMEOUT) {
            Ok(len) => {
                buffer.truncate(len);
                completion(urb, UsbStatus::Ok, buffer, len)
            }
            Err(rusb::Error::Pipe) => stall_with_clear(handle, urb, endpoint),
            Err(e) => completion(urb, map_rusb_error(e), Vec::new(), 0),
        }
    } else {
        match handle.write_bulk(endpoint, &urb.payload, DEFAULT_TIMEOUT) {
            Ok(len) => completion(urb, UsbStatus::Ok, Vec::new(), len),
            Err(rusb::Error::Pipe) => stall_with_clear(handle, urb, endpoint),
            Err(e) => completion(urb, map_rusb_error(e), Vec::new(), 0),
        }
    }
}

// A stalled endpoint stays stalled until the halt is cleared; report the
// stall to the peer but clear the halt so the next URB has a chance.
fn stall_with_clear(
    handle: &DeviceHandle<Context>,
    urb: &UrbDispatch,
    endpoint: u8,
) -> UrbCompletion {
    warn!("endpoint {:#04x} stalled (seqnum={})", endpoint, urb.seqnum);
    if let Err(e) = handle.clear_halt(endpoint) {
        warn!("failed to clear halt on {:#04x}: {}", endpoint, e);
    }
    completion(urb, UsbStatus::Stall, Vec::new(), 0)
}

fn execute_interrupt(handle: &DeviceHandle<Context>, urb: &UrbDispatch) -> UrbCompletion {
    let endpoint = urb.endpoint_address();

    if urb.direction == Direction::In {
        let mut buffer = vec![0u8; urb.buffer_length];
        match handle.read_interrupt(endpoint, &mut buffer, INTERRUPT_IN_TIMEOUT) {
            Ok(len) => {
                buffer.truncate(len);
                if len > 0 {
                    trace!(
                        "interrupt IN ep={:#04x} len={} data={:02x?}",
                        endpoint,
                        len,
                        &buffer[..len.min(16)]
                    );
                }
                completion(urb, UsbStatus::Ok, buffer, len)
            }
            // No data pending; empty success lets the peer re-submit.
            Err(rusb::Error::Timeout) => completion(urb, UsbStatus::Ok, Vec::new(), 0),
            Err(e) => completion(urb, map_rusb_error(e), Vec::new(), 0),
        }
    } else {
        match handle.write_interrupt(endpoint, &urb.payload, DEFAULT_TIMEOUT) {
            Ok(len) => completion(urb, UsbStatus::Ok, Vec::new(), len),
            Err(e) => completion(urb, map_rusb_error(e), Vec::new(), 0),
        }
    }
}

// rusb exposes no synchronous isochronous API; streams are acknowledged at
// the protocol level so audio/video class drivers keep running. IN packets
// report empty, OUT packets report fully sent.
fn execute_isochronous(urb: &UrbDispatch) -> UrbCompletion {
    let is_in = urb.direction == Direction::In;

    let iso_packets: Vec<IsoPacket> = urb
        .iso_packets
        .iter()
        .map(|p| IsoPacket {
            offset: p.offset,
            length: p.length,
            actual_length: if is_in { 0 } else { p.length },
            status: 0,
        })
        .collect();

    let data = if is_in {
        vec![0u8; urb.buffer_length]
    } else {
        Vec::new()
    };
    let actual = if is_in { 0 } else { urb.payload.len() };

    UrbCompletion {
        seqnum: urb.seqnum,
        endpoint: urb.endpoint,
        direction: urb.direction,
        status: UsbStatus::Ok,
        data,
        actual_length: actual,
        start_frame: urb.start_frame,
        error_count: 0,
        iso_packets,
    }
}

/// Map rusb errors onto wire status values
pub fn map_rusb_error(err: rusb::Error) -> UsbStatus {
    match err {
        rusb::Error::Timeout => UsbStatus::TimedOut,
        rusb::Error::Pipe => UsbStatus::Stall,
        rusb::Error::NoDevice | rusb::Error::NotFound => UsbStatus::Disconnected,
        rusb::Error::Overflow => UsbStatus::Overrun,
        rusb::Error::Interrupted => UsbStatus::Cancelled,
        _ => UsbStatus::Unknown,
    }
}
