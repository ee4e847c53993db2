//! Attached-client I/O engine
//!
//! Full-duplex relay between the TCP socket and the captured device. Three
//! concurrent activities per attachment, joined through bounded channels:
//!
//! - the **reader** (this task) parses URB frames, enforces limits, and
//!   dispatches submissions to the capture driver;
//! - the **completion demux** matches driver completions against in-flight
//!   contexts and builds reply frames;
//! - the **writer** is the single consumer of the reply queue and owns the
//!   socket's write half.
//!
//! Backpressure is two semaphores acquired by the reader before dispatch: a
//! per-endpoint in-flight slot and a global outstanding-payload budget. Both
//! are released when the URB settles (its context drops). Unlink handling
//! never touches either, so cancellation cannot be starved by a slow
//! endpoint.

use crate::capture::CapturedDevice;
use crate::pcap::{CaptureRecord, CaptureSink, UrbEvent};
use crate::registry::BindingRegistry;
use anyhow::Result;
use common::{TransferKind, UrbCompletion, UrbDispatch};
use protocol::urb::{self, URB_HEADER_SIZE};
use protocol::{
    Direction, IsoPacket, SubmitCmd, SubmitReply, UnlinkCmd, UnlinkReply, UrbCommand, errno,
};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tracing::{debug, info, trace, warn};

/// How long cancelled URBs get to settle before the session stops waiting
const CANCEL_DRAIN_DEADLINE: Duration = Duration::from_millis(500);

/// How long the writer gets to flush its remaining frames on teardown
const WRITER_FLUSH_DEADLINE: Duration = Duration::from_secs(1);

/// Depth of the completion and reply queues
pub const COMPLETION_QUEUE_DEPTH: usize = 256;

/// Hard ceiling on isochronous packet counts per URB
const MAX_ISO_PACKETS: i32 = 1024;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a session identifier for registry bookkeeping
pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Resource limits for one attached session
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Largest accepted `transfer_buffer_length`
    pub max_transfer_len: usize,
    /// In-flight URBs per endpoint before the reader suspends
    pub per_endpoint_inflight: usize,
    /// Total outstanding payload bytes before the reader suspends
    pub payload_budget: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_transfer_len: 16 * 1024 * 1024,
            per_endpoint_inflight: 32,
            payload_budget: 64 * 1024 * 1024,
        }
    }
}

/// Bookkeeping for one in-flight URB
///
/// Dropping the context releases its endpoint slot and payload budget.
struct UrbContext {
    ep: u32,
    direction: Direction,
    kind: TransferKind,
    submitted_at: Instant,
    _endpoint_slot: OwnedSemaphorePermit,
    _budget: OwnedSemaphorePermit,
}

type Inflight = Arc<Mutex<HashMap<u32, UrbContext>>>;

enum ReplyFrame {
    Submit {
        reply: SubmitReply,
        data: Vec<u8>,
        iso: Vec<IsoPacket>,
    },
    Unlink(UnlinkReply),
}

#[derive(Debug)]
enum ExitReason {
    /// Peer closed the connection
    ClientClosed,
    /// Server is shutting down
    Shutdown,
    /// Socket read failed
    Transport(std::io::Error),
    /// Peer sent something the protocol forbids
    Protocol(String),
    /// Write half failed; no point reading further
    WriterGone,
    /// Capture driver stopped accepting URBs
    DriverGone,
}

/// Run the URB pipeline for one attachment
///
/// Consumes the socket; returns once the device is released and the registry
/// shows the device detached.
pub async fn run_session(
    socket: TcpStream,
    device: Arc<CapturedDevice>,
    completions: mpsc::Receiver<UrbCompletion>,
    registry: Arc<BindingRegistry>,
    limits: SessionLimits,
    shutdown: watch::Receiver<bool>,
    sink: Option<CaptureSink>,
) -> Result<()> {
    let bus_id = device.exported().bus_id;
    let devid = device.exported().device_id().0;
    let (read_half, write_half) = socket.into_split();

    let inflight: Inflight = Arc::new(Mutex::new(HashMap::new()));
    let (reply_tx, reply_rx) = mpsc::channel(COMPLETION_QUEUE_DEPTH);
    let (closed_tx, closed_rx) = watch::channel(false);

    let writer = tokio::spawn(writer_task(write_half, reply_rx, closed_tx));
    let demux = tokio::spawn(demux_task(
        completions,
        inflight.clone(),
        reply_tx.clone(),
        sink.clone(),
        devid,
    ));

    let reason = reader_loop(
        read_half,
        &device,
        &inflight,
        &reply_tx,
        &sink,
        devid,
        limits,
        shutdown,
        closed_rx,
    )
    .await;

    match &reason {
        ExitReason::ClientClosed => info!("session {}: client disconnected", bus_id),
        ExitReason::Shutdown => info!("session {}: server shutdown", bus_id),
        ExitReason::Transport(e) => warn!("session {}: transport error: {}", bus_id, e),
        ExitReason::Protocol(e) => warn!("session {}: protocol error: {}", bus_id, e),
        ExitReason::WriterGone => warn!("session {}: socket write failed", bus_id),
        ExitReason::DriverGone => warn!("session {}: capture driver went away", bus_id),
    }

    // Teardown. Each step runs regardless of the others failing:
    // cancel outstanding URBs, release the device, drain what settles into
    // the writer while the socket lives, detach in the registry.
    let outstanding: Vec<u32> = inflight.lock().expect("inflight lock").keys().copied().collect();
    if !outstanding.is_empty() {
        debug!(
            "session {}: cancelling {} in-flight URB(s)",
            bus_id,
            outstanding.len()
        );
        for seqnum in &outstanding {
            device.cancel(*seqnum);
        }
    }
    device.release();
    drop(reply_tx);

    let demux_abort = demux.abort_handle();
    if tokio::time::timeout(CANCEL_DRAIN_DEADLINE, demux).await.is_err() {
        warn!("session {}: completion drain exceeded deadline", bus_id);
        demux_abort.abort();
    }

    let writer_abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_FLUSH_DEADLINE, writer).await.is_err() {
        warn!("session {}: writer flush exceeded deadline", bus_id);
        writer_abort.abort();
    }

    if let Err(e) = registry.mark_detached(bus_id) {
        warn!("session {}: mark_detached failed: {}", bus_id, e);
    }

    // Anything still unsettled drops here, freeing its budget.
    inflight.lock().expect("inflight lock").clear();
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn reader_loop(
    mut read_half: OwnedReadHalf,
    device: &CapturedDevice,
    inflight: &Inflight,
    reply_tx: &mpsc::Sender<ReplyFrame>,
    sink: &Option<CaptureSink>,
    devid: u32,
    limits: SessionLimits,
    mut shutdown: watch::Receiver<bool>,
    mut closed: watch::Receiver<bool>,
) -> ExitReason {
    let budget = Arc::new(Semaphore::new(limits.payload_budget));
    let mut endpoint_slots: HashMap<(u32, Direction), Arc<Semaphore>> = HashMap::new();

    loop {
        if *shutdown.borrow_and_update() {
            return ExitReason::Shutdown;
        }

        let mut header = [0u8; URB_HEADER_SIZE];
        tokio::select! {
            _ = shutdown.changed() => return ExitReason::Shutdown,
            _ = closed.changed() => return ExitReason::WriterGone,
            res = read_half.read_exact(&mut header) => {
                if let Err(e) = res {
                    return if e.kind() == ErrorKind::UnexpectedEof {
                        ExitReason::ClientClosed
                    } else {
                        ExitReason::Transport(e)
                    };
                }
            }
        }

        let command = match UrbCommand::decode(&header) {
            Ok(command) => command,
            Err(e) => return ExitReason::Protocol(e.to_string()),
        };

        let result = match command {
            UrbCommand::Submit(cmd) => {
                handle_submit(
                    &mut read_half,
                    device,
                    inflight,
                    sink,
                    devid,
                    limits,
                    &budget,
                    &mut endpoint_slots,
                    &mut shutdown,
                    &mut closed,
                    cmd,
                )
                .await
            }
            UrbCommand::Unlink(cmd) => handle_unlink(device, inflight, reply_tx, cmd).await,
        };

        if let Err(reason) = result {
            return reason;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_submit(
    read_half: &mut OwnedReadHalf,
    device: &CapturedDevice,
    inflight: &Inflight,
    sink: &Option<CaptureSink>,
    devid: u32,
    limits: SessionLimits,
    budget: &Arc<Semaphore>,
    endpoint_slots: &mut HashMap<(u32, Direction), Arc<Semaphore>>,
    shutdown: &mut watch::Receiver<bool>,
    closed: &mut watch::Receiver<bool>,
    cmd: SubmitCmd,
) -> std::result::Result<(), ExitReason> {
    if cmd.ep > 15 {
        return Err(ExitReason::Protocol(format!("endpoint {} out of range", cmd.ep)));
    }
    if cmd.number_of_packets < 0 || cmd.number_of_packets > MAX_ISO_PACKETS {
        return Err(ExitReason::Protocol(format!(
            "invalid packet count {}",
            cmd.number_of_packets
        )));
    }
    if cmd.transfer_buffer_length < 0 || cmd.transfer_buffer_length as usize > limits.max_transfer_len
    {
        return Err(ExitReason::Protocol(format!(
            "transfer buffer length {} exceeds cap {}",
            cmd.transfer_buffer_length, limits.max_transfer_len
        )));
    }
    let buffer_length = cmd.transfer_buffer_length as usize;

    // Body: OUT payload first, then the iso descriptor vector.
    let mut payload = Vec::new();
    if cmd.direction == Direction::Out && buffer_length > 0 {
        payload = vec![0u8; buffer_length];
        read_body(read_half, &mut payload, shutdown, closed).await?;
    }
    let mut iso_packets = Vec::new();
    if cmd.number_of_packets > 0 {
        let mut raw = vec![0u8; cmd.number_of_packets as usize * IsoPacket::SIZE];
        read_body(read_half, &mut raw, shutdown, closed).await?;
        iso_packets = urb::read_iso_packets(
            &mut std::io::Cursor::new(raw),
            cmd.number_of_packets as usize,
        )
        .map_err(|e| ExitReason::Protocol(e.to_string()))?;
    }

    let kind = if cmd.ep == 0 {
        TransferKind::Control
    } else if cmd.number_of_packets > 0 {
        TransferKind::Isochronous
    } else if cmd.interval > 0 {
        TransferKind::Interrupt
    } else {
        TransferKind::Bulk
    };

    // Backpressure: an endpoint slot, then payload budget. Waits here are
    // resolved by completions releasing permits, or by shutdown.
    let slots = endpoint_slots
        .entry((cmd.ep, cmd.direction))
        .or_insert_with(|| Arc::new(Semaphore::new(limits.per_endpoint_inflight)))
        .clone();
    let endpoint_slot = tokio::select! {
        _ = shutdown.changed() => return Err(ExitReason::Shutdown),
        _ = closed.changed() => return Err(ExitReason::WriterGone),
        permit = slots.acquire_owned() => permit.expect("endpoint semaphore closed"),
    };
    let budget_permit = tokio::select! {
        _ = shutdown.changed() => return Err(ExitReason::Shutdown),
        _ = closed.changed() => return Err(ExitReason::WriterGone),
        permit = budget.clone().acquire_many_owned(buffer_length as u32) => {
            permit.expect("budget semaphore closed")
        }
    };

    if let Some(sink) = sink {
        sink.record(CaptureRecord {
            timestamp_100ns: CaptureRecord::now_100ns(),
            event: UrbEvent::Submit,
            seqnum: cmd.seqnum,
            devid,
            endpoint: cmd.ep as u8,
            direction: cmd.direction,
            transfer: kind,
            setup: (kind == TransferKind::Control).then_some(cmd.setup),
            status: 0,
            payload: payload.clone(),
        });
    }

    let context = UrbContext {
        ep: cmd.ep,
        direction: cmd.direction,
        kind,
        submitted_at: Instant::now(),
        _endpoint_slot: endpoint_slot,
        _budget: budget_permit,
    };
    {
        let mut inflight = inflight.lock().expect("inflight lock");
        if inflight.insert(cmd.seqnum, context).is_some() {
            return Err(ExitReason::Protocol(format!(
                "duplicate seqnum {}",
                cmd.seqnum
            )));
        }
    }

    let (dispatch, cancel) = UrbDispatch::new(
        cmd.seqnum,
        cmd.ep as u8,
        cmd.direction,
        kind,
        cmd.setup,
        payload,
        buffer_length,
        cmd.start_frame,
        cmd.interval,
        iso_packets,
    );
    trace!(
        "dispatch seqnum={} ep={} kind={:?} len={}",
        cmd.seqnum, cmd.ep, kind, buffer_length
    );
    if device.submit(dispatch, cancel).await.is_err() {
        inflight.lock().expect("inflight lock").remove(&cmd.seqnum);
        return Err(ExitReason::DriverGone);
    }
    Ok(())
}

async fn handle_unlink(
    device: &CapturedDevice,
    inflight: &Inflight,
    reply_tx: &mpsc::Sender<ReplyFrame>,
    cmd: UnlinkCmd,
) -> std::result::Result<(), ExitReason> {
    let removed = inflight
        .lock()
        .expect("inflight lock")
        .remove(&cmd.unlink_seqnum);

    let status = match removed {
        Some(context) => {
            // Still in flight: suppress its RET_SUBMIT and acknowledge the
            // cancel. Dropping the context frees its budget immediately.
            device.cancel(cmd.unlink_seqnum);
            debug!(
                "unlinked seqnum={} after {:?}",
                cmd.unlink_seqnum,
                context.submitted_at.elapsed()
            );
            drop(context);
            -errno::ECONNRESET
        }
        // Completed already, or never known: nothing to cancel.
        None => 0,
    };

    let reply = UnlinkReply {
        seqnum: cmd.seqnum,
        devid: cmd.devid,
        direction: cmd.direction,
        ep: cmd.ep,
        status,
    };
    reply_tx
        .send(ReplyFrame::Unlink(reply))
        .await
        .map_err(|_| ExitReason::WriterGone)
}

async fn read_body(
    read_half: &mut OwnedReadHalf,
    buf: &mut [u8],
    shutdown: &mut watch::Receiver<bool>,
    closed: &mut watch::Receiver<bool>,
) -> std::result::Result<(), ExitReason> {
    tokio::select! {
        _ = shutdown.changed() => Err(ExitReason::Shutdown),
        _ = closed.changed() => Err(ExitReason::WriterGone),
        res = read_half.read_exact(buf) => res.map(|_| ()).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                ExitReason::ClientClosed
            } else {
                ExitReason::Transport(e)
            }
        }),
    }
}

async fn demux_task(
    mut completions: mpsc::Receiver<UrbCompletion>,
    inflight: Inflight,
    reply_tx: mpsc::Sender<ReplyFrame>,
    sink: Option<CaptureSink>,
    devid: u32,
) {
    while let Some(done) = completions.recv().await {
        let context = inflight.lock().expect("inflight lock").remove(&done.seqnum);
        let Some(context) = context else {
            // Unlinked; its RET_UNLINK already settled the seqnum.
            trace!("dropping completion for unlinked seqnum={}", done.seqnum);
            continue;
        };

        let is_iso = context.kind == TransferKind::Isochronous;
        let data = if context.direction == Direction::In {
            done.data
        } else {
            Vec::new()
        };

        let reply = SubmitReply {
            seqnum: done.seqnum,
            devid,
            direction: context.direction,
            ep: context.ep,
            status: done.status.to_errno(),
            actual_length: done.actual_length as i32,
            start_frame: done.start_frame,
            number_of_packets: if is_iso { done.iso_packets.len() as i32 } else { 0 },
            error_count: done.error_count,
        };
        trace!(
            "complete seqnum={} status={} actual={} ({:?} in flight)",
            reply.seqnum,
            reply.status,
            reply.actual_length,
            context.submitted_at.elapsed()
        );

        if let Some(sink) = &sink {
            sink.record(CaptureRecord {
                timestamp_100ns: CaptureRecord::now_100ns(),
                event: UrbEvent::Complete,
                seqnum: done.seqnum,
                devid,
                endpoint: context.ep as u8,
                direction: context.direction,
                transfer: context.kind,
                setup: None,
                status: reply.status,
                payload: data.clone(),
            });
        }

        // URB settled; free its slot and budget before queueing the frame.
        drop(context);

        if reply_tx
            .send(ReplyFrame::Submit {
                reply,
                data,
                iso: done.iso_packets,
            })
            .await
            .is_err()
        {
            break;
        }
    }
}

async fn writer_task(
    mut write_half: OwnedWriteHalf,
    mut reply_rx: mpsc::Receiver<ReplyFrame>,
    closed: watch::Sender<bool>,
) {
    while let Some(frame) = reply_rx.recv().await {
        let result = match frame {
            ReplyFrame::Submit { reply, data, iso } => {
                let mut buf = reply.encode().to_vec();
                buf.extend_from_slice(&data);
                urb::write_iso_packets(&mut buf, &iso).expect("vec write");
                write_half.write_all(&buf).await
            }
            ReplyFrame::Unlink(reply) => write_half.write_all(&reply.encode()).await,
        };
        if let Err(e) = result {
            debug!("writer stopping: {}", e);
            break;
        }
    }
    let _ = write_half.shutdown().await;
    let _ = closed.send(true);
}
