//! pcapng capture sink
//!
//! Optional, strictly advisory packet capture. Every submitted and completed
//! URB becomes an Enhanced Packet Block whose payload is a usbmon-style
//! record (link-type 220, `LINKTYPE_USB_LINUX_MMAPPED`), so captures open
//! directly in Wireshark.
//!
//! The feed is a bounded channel with `try_send`: when the writer lags,
//! records are dropped and counted, never queued unbounded. A single task
//! owns the file and emits the Interface Statistics Block on close.

use common::TransferKind;
use protocol::Direction;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// pcapng link type for usbmon-style payloads
pub const LINKTYPE_USB_LINUX_MMAPPED: u16 = 220;

/// Timestamp resolution: 10^-7 s (100 ns ticks)
const IF_TSRESOL: u8 = 7;

const FEED_DEPTH: usize = 512;

/// Which side of a URB's life this record captures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbEvent {
    Submit,
    Complete,
}

/// One captured URB event
#[derive(Debug, Clone)]
pub struct CaptureRecord {
    /// 100 ns ticks since the UNIX epoch
    pub timestamp_100ns: u64,
    pub event: UrbEvent,
    pub seqnum: u32,
    pub devid: u32,
    pub endpoint: u8,
    pub direction: Direction,
    pub transfer: TransferKind,
    pub setup: Option<[u8; 8]>,
    pub status: i32,
    pub payload: Vec<u8>,
}

impl CaptureRecord {
    /// Current time in 100 ns ticks since the UNIX epoch
    pub fn now_100ns() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64 / 100)
            .unwrap_or(0)
    }
}

/// Handle used by sessions to feed the sink
#[derive(Clone)]
pub struct CaptureSink {
    tx: mpsc::Sender<CaptureRecord>,
    dropped: Arc<AtomicU64>,
}

impl CaptureSink {
    /// Record a URB event; drops (and counts) when the writer lags
    pub fn record(&self, record: CaptureRecord) {
        if self.tx.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// How many records have been dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Open the capture file and spawn the writer task
///
/// Drop every [`CaptureSink`] clone to close the feed; the returned handle
/// resolves once the statistics block is written and the file is flushed.
pub async fn spawn_capture_writer(
    path: &Path,
) -> std::io::Result<(CaptureSink, JoinHandle<()>)> {
    let mut file = File::create(path).await?;
    file.write_all(&section_header_block()).await?;
    file.write_all(&interface_description_block()).await?;

    let (tx, mut rx) = mpsc::channel(FEED_DEPTH);
    let dropped = Arc::new(AtomicU64::new(0));
    let sink = CaptureSink {
        tx,
        dropped: dropped.clone(),
    };

    info!("capturing URB traffic to {}", path.display());

    let handle = tokio::spawn(async move {
        let mut written: u64 = 0;
        while let Some(record) = rx.recv().await {
            let block = enhanced_packet_block(&record);
            if let Err(e) = file.write_all(&block).await {
                warn!("capture write failed, stopping sink: {}", e);
                rx.close();
                break;
            }
            written += 1;
        }

        let lost = dropped.load(Ordering::Relaxed);
        let stats = interface_statistics_block(written, lost, CaptureRecord::now_100ns());
        if let Err(e) = file.write_all(&stats).await {
            warn!("capture statistics write failed: {}", e);
        }
        if let Err(e) = file.flush().await {
            warn!("capture flush failed: {}", e);
        }
        debug!("capture sink closed: {} written, {} dropped", written, lost);
    });

    Ok((sink, handle))
}

// -- pcapng block builders -------------------------------------------------
//
// Pure functions returning fully formed blocks, so tests can inspect bytes
// without touching the filesystem.

/// Section Header Block
pub fn section_header_block() -> Vec<u8> {
    const BLOCK_TYPE: u32 = 0x0A0D_0D0A;

    let mut body = Vec::new();
    body.extend_from_slice(&0x1A2B_3C4Du32.to_le_bytes()); // byte-order magic
    body.extend_from_slice(&1u16.to_le_bytes()); // major
    body.extend_from_slice(&0u16.to_le_bytes()); // minor
    body.extend_from_slice(&0xFFFF_FFFF_FFFF_FFFFu64.to_le_bytes()); // section length

    let mut opts = Vec::new();
    write_opt(&mut opts, 4, b"usbip-share"); // shb_userappl
    write_opt_end(&mut opts);

    build_block(BLOCK_TYPE, &body, &opts)
}

/// Interface Description Block for the URB pseudo-interface
pub fn interface_description_block() -> Vec<u8> {
    const BLOCK_TYPE: u32 = 0x0000_0001;

    let mut body = Vec::new();
    body.extend_from_slice(&LINKTYPE_USB_LINUX_MMAPPED.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes()); // reserved
    body.extend_from_slice(&0u32.to_le_bytes()); // snaplen: unlimited

    let mut opts = Vec::new();
    write_opt(&mut opts, 2, b"usbip-share"); // if_name
    write_opt(&mut opts, 9, &[IF_TSRESOL]); // if_tsresol
    write_opt_end(&mut opts);

    build_block(BLOCK_TYPE, &body, &opts)
}

/// Enhanced Packet Block carrying one usbmon record
pub fn enhanced_packet_block(record: &CaptureRecord) -> Vec<u8> {
    const BLOCK_TYPE: u32 = 0x0000_0006;

    let packet = usbmon_packet(record);

    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes()); // interface id
    body.extend_from_slice(&((record.timestamp_100ns >> 32) as u32).to_le_bytes());
    body.extend_from_slice(&((record.timestamp_100ns & 0xFFFF_FFFF) as u32).to_le_bytes());
    let len = packet.len() as u32;
    body.extend_from_slice(&len.to_le_bytes()); // captured length
    body.extend_from_slice(&len.to_le_bytes()); // original length
    body.extend_from_slice(&packet);
    pad_to_32(&mut body);

    let mut opts = Vec::new();
    write_opt_end(&mut opts);

    build_block(BLOCK_TYPE, &body, &opts)
}

/// Interface Statistics Block written on close
pub fn interface_statistics_block(received: u64, dropped: u64, timestamp_100ns: u64) -> Vec<u8> {
    const BLOCK_TYPE: u32 = 0x0000_0005;

    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes()); // interface id
    body.extend_from_slice(&((timestamp_100ns >> 32) as u32).to_le_bytes());
    body.extend_from_slice(&((timestamp_100ns & 0xFFFF_FFFF) as u32).to_le_bytes());

    let mut opts = Vec::new();
    write_opt(&mut opts, 4, &received.to_le_bytes()); // isb_ifrecv
    write_opt(&mut opts, 5, &dropped.to_le_bytes()); // isb_ifdrop
    write_opt_end(&mut opts);

    build_block(BLOCK_TYPE, &body, &opts)
}

/// The 64-byte usbmon header plus payload, as link-type 220 expects
fn usbmon_packet(record: &CaptureRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + record.payload.len());

    let event_type: u8 = match record.event {
        UrbEvent::Submit => b'S',
        UrbEvent::Complete => b'C',
    };
    let xfer_type: u8 = match record.transfer {
        TransferKind::Isochronous => 0,
        TransferKind::Interrupt => 1,
        TransferKind::Control => 2,
        TransferKind::Bulk => 3,
    };
    let epnum = match record.direction {
        Direction::In => record.endpoint | 0x80,
        Direction::Out => record.endpoint,
    };
    let devnum = (record.devid & 0xff) as u8;
    let busnum = (record.devid >> 16) as u16;

    let ts_sec = (record.timestamp_100ns / 10_000_000) as i64;
    let ts_usec = ((record.timestamp_100ns % 10_000_000) / 10) as i32;

    out.extend_from_slice(&(record.seqnum as u64).to_le_bytes()); // urb id
    out.push(event_type);
    out.push(xfer_type);
    out.push(epnum);
    out.push(devnum);
    out.extend_from_slice(&busnum.to_le_bytes());
    out.push(if record.setup.is_some() { 0 } else { b'-' }); // flag_setup
    out.push(if record.payload.is_empty() { b'-' } else { 0 }); // flag_data
    out.extend_from_slice(&ts_sec.to_le_bytes());
    out.extend_from_slice(&ts_usec.to_le_bytes());
    out.extend_from_slice(&record.status.to_le_bytes());
    out.extend_from_slice(&(record.payload.len() as u32).to_le_bytes()); // urb_len
    out.extend_from_slice(&(record.payload.len() as u32).to_le_bytes()); // data_len
    out.extend_from_slice(&record.setup.unwrap_or([0u8; 8]));
    out.extend_from_slice(&0u32.to_le_bytes()); // interval
    out.extend_from_slice(&0u32.to_le_bytes()); // start_frame
    out.extend_from_slice(&0u32.to_le_bytes()); // xfer_flags
    out.extend_from_slice(&0u32.to_le_bytes()); // ndesc
    debug_assert_eq!(out.len(), 64);

    out.extend_from_slice(&record.payload);
    out
}

fn build_block(block_type: u32, body: &[u8], opts: &[u8]) -> Vec<u8> {
    let total_len = (12 + body.len() + opts.len()) as u32;
    let mut out = Vec::with_capacity(total_len as usize);
    out.extend_from_slice(&block_type.to_le_bytes());
    out.extend_from_slice(&total_len.to_le_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(opts);
    out.extend_from_slice(&total_len.to_le_bytes());
    out
}

fn pad_to_32(buf: &mut Vec<u8>) {
    let pad = (4 - (buf.len() % 4)) % 4;
    buf.extend(std::iter::repeat_n(0u8, pad));
}

fn write_opt(out: &mut Vec<u8>, code: u16, val: &[u8]) {
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(&(val.len() as u16).to_le_bytes());
    out.extend_from_slice(val);
    pad_to_32(out);
}

fn write_opt_end(out: &mut Vec<u8>) {
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> CaptureRecord {
        CaptureRecord {
            timestamp_100ns: 0x0001_0002_0003_0004,
            event: UrbEvent::Submit,
            seqnum: 7,
            devid: 0x0003_0004,
            endpoint: 1,
            direction: Direction::In,
            transfer: TransferKind::Bulk,
            setup: None,
            status: 0,
            payload: vec![0xaa; 5],
        }
    }

    #[test]
    fn test_section_header_magic() {
        let bytes = section_header_block();
        assert_eq!(&bytes[..4], &0x0A0D_0D0Au32.to_le_bytes());
        let total = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        assert_eq!(bytes.len(), total);
        assert_eq!(&bytes[total - 4..], &(total as u32).to_le_bytes());
        // byte-order magic, then major=1 minor=0
        assert_eq!(&bytes[8..12], &0x1A2B_3C4Du32.to_le_bytes());
        assert_eq!(&bytes[12..14], &1u16.to_le_bytes());
        assert_eq!(&bytes[14..16], &0u16.to_le_bytes());
    }

    #[test]
    fn test_interface_block_link_type() {
        let bytes = interface_description_block();
        assert_eq!(
            u16::from_le_bytes(bytes[8..10].try_into().unwrap()),
            LINKTYPE_USB_LINUX_MMAPPED
        );
    }

    #[test]
    fn test_enhanced_packet_block_shape() {
        let bytes = enhanced_packet_block(&sample_record());
        let total = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        assert_eq!(bytes.len(), total);
        assert_eq!(total % 4, 0);

        // captured length = 64-byte usbmon header + 5-byte payload
        let cap_len = u32::from_le_bytes(bytes[20..24].try_into().unwrap());
        assert_eq!(cap_len, 69);

        // usbmon header starts at offset 28: urb id, then 'S' and bulk type
        let urb_id = u64::from_le_bytes(bytes[28..36].try_into().unwrap());
        assert_eq!(urb_id, 7);
        assert_eq!(bytes[36], b'S');
        assert_eq!(bytes[37], 3);
        assert_eq!(bytes[38], 0x81); // IN endpoint 1
    }

    #[test]
    fn test_statistics_block_counters() {
        let bytes = interface_statistics_block(10, 3, 0);
        // first option after the 12-byte body: isb_ifrecv
        let code = u16::from_le_bytes(bytes[20..22].try_into().unwrap());
        assert_eq!(code, 4);
        let value = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        assert_eq!(value, 10);
        let code = u16::from_le_bytes(bytes[32..34].try_into().unwrap());
        assert_eq!(code, 5);
        let value = u64::from_le_bytes(bytes[36..44].try_into().unwrap());
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_writer_emits_blocks_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcapng");

        let (sink, handle) = spawn_capture_writer(&path).await.unwrap();
        sink.record(sample_record());
        drop(sink);
        handle.await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        // SHB, IDB, one EPB, one ISB
        assert_eq!(&bytes[..4], &0x0A0D_0D0Au32.to_le_bytes());
        let mut offset = 0;
        let mut block_types = Vec::new();
        while offset + 8 <= bytes.len() {
            let block_type = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
            let len =
                u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap()) as usize;
            block_types.push(block_type);
            offset += len;
        }
        assert_eq!(block_types, vec![0x0A0D_0D0A, 1, 6, 5]);
    }
}
