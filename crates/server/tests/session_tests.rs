//! End-to-end protocol tests
//!
//! Drives a real listener over loopback TCP with the mock enumerator and
//! mock capture driver: device list filtering, import policy, the URB
//! pipeline, unlink handling, and teardown on disconnect.
//!
//! Run with: `cargo test -p server --test session_tests`

use protocol::op::{
    DEVICE_RECORD_SIZE, OP_DEVLIST, OP_STATUS_OK, read_device_record, write_import_request,
};
use protocol::urb::URB_HEADER_SIZE;
use protocol::{
    BusId, Direction, ExportedDevice, IsoPacket, OpHeader, SubmitCmd, UnlinkCmd, UrbCommand,
    UrbReply, errno,
};
use server::capture::MockDriver;
use server::enumerator::MockEnumerator;
use server::net::{Listener, ServerState, SessionLimits};
use server::registry::BindingRegistry;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

const TICK: Duration = Duration::from_millis(50);
const TEST_DEADLINE: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    registry: Arc<BindingRegistry>,
    enumerator: Arc<MockEnumerator>,
    shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn start(driver: MockDriver, bus_ids: &[&str], limits: SessionLimits) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            Arc::new(BindingRegistry::open(dir.path().join("devices.toml")).unwrap());

        let parsed: Vec<BusId> = bus_ids.iter().map(|s| s.parse().unwrap()).collect();
        let enumerator = Arc::new(MockEnumerator::with_devices(&parsed));

        let state = Arc::new(ServerState {
            registry: registry.clone(),
            enumerator: enumerator.clone(),
            driver: Arc::new(driver),
            limits,
            devlist_all: false,
            sink: None,
        });

        let listener = Listener::bind(0, false).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(listener.run(state, shutdown_rx));

        Self {
            addr,
            registry,
            enumerator,
            shutdown,
            _dir: dir,
        }
    }

    fn bind(&self, bus_id: &str) {
        let bus_id: BusId = bus_id.parse().unwrap();
        self.registry
            .bind(bus_id, format!("Test device {bus_id}"), "inst".into())
            .unwrap();
    }

    fn attached(&self, bus_id: &str) -> bool {
        let bus_id: BusId = bus_id.parse().unwrap();
        self.registry
            .list_shared()
            .iter()
            .any(|d| d.bus_id == bus_id && d.attached.is_some())
    }

    async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn read_record(stream: &mut TcpStream) -> ExportedDevice {
    let mut fixed = vec![0u8; DEVICE_RECORD_SIZE];
    stream.read_exact(&mut fixed).await.unwrap();
    let num_interfaces = fixed[DEVICE_RECORD_SIZE - 1] as usize;
    let mut interfaces = vec![0u8; 4 * num_interfaces];
    stream.read_exact(&mut interfaces).await.unwrap();
    fixed.extend_from_slice(&interfaces);
    read_device_record(&mut Cursor::new(fixed)).unwrap()
}

async fn request_devlist(stream: &mut TcpStream) -> Vec<ExportedDevice> {
    let mut buf = Vec::new();
    OpHeader::request(OP_DEVLIST).write_to(&mut buf).unwrap();
    stream.write_all(&buf).await.unwrap();

    let mut raw = [0u8; OpHeader::SIZE];
    stream.read_exact(&mut raw).await.unwrap();
    let header = OpHeader::read_from(&mut Cursor::new(&raw[..])).unwrap();
    assert_eq!(header.code, OP_DEVLIST);
    assert_eq!(header.status, OP_STATUS_OK);

    let ndev = stream.read_u32().await.unwrap();
    let mut devices = Vec::new();
    for _ in 0..ndev {
        devices.push(read_record(stream).await);
    }
    devices
}

async fn request_import(stream: &mut TcpStream, bus_id: &str) -> (u32, Option<ExportedDevice>) {
    let bus_id: BusId = bus_id.parse().unwrap();
    let mut buf = Vec::new();
    write_import_request(&mut buf, bus_id).unwrap();
    stream.write_all(&buf).await.unwrap();

    let mut raw = [0u8; OpHeader::SIZE];
    stream.read_exact(&mut raw).await.unwrap();
    let header = OpHeader::read_from(&mut Cursor::new(&raw[..])).unwrap();
    if header.status == OP_STATUS_OK {
        let record = read_record(stream).await;
        (header.status, Some(record))
    } else {
        (header.status, None)
    }
}

async fn send_submit(stream: &mut TcpStream, cmd: SubmitCmd, payload: &[u8]) {
    let frame = UrbCommand::Submit(cmd).encode();
    stream.write_all(&frame).await.unwrap();
    if !payload.is_empty() {
        stream.write_all(payload).await.unwrap();
    }
}

async fn send_unlink(stream: &mut TcpStream, seqnum: u32, unlink_seqnum: u32) {
    let frame = UrbCommand::Unlink(UnlinkCmd {
        seqnum,
        devid: 0x0003_0004,
        direction: Direction::Out,
        ep: 0,
        unlink_seqnum,
    })
    .encode();
    stream.write_all(&frame).await.unwrap();
}

async fn read_reply(stream: &mut TcpStream) -> (UrbReply, Vec<u8>, Vec<IsoPacket>) {
    let mut raw = [0u8; URB_HEADER_SIZE];
    stream.read_exact(&mut raw).await.unwrap();
    let reply = UrbReply::decode(&raw).unwrap();

    let mut data = Vec::new();
    let mut iso = Vec::new();
    if let UrbReply::Submit(submit) = &reply {
        if submit.direction == Direction::In && submit.actual_length > 0 {
            data = vec![0u8; submit.actual_length as usize];
            stream.read_exact(&mut data).await.unwrap();
        }
        if submit.number_of_packets > 0 {
            let mut raw = vec![0u8; submit.number_of_packets as usize * IsoPacket::SIZE];
            stream.read_exact(&mut raw).await.unwrap();
            iso = protocol::urb::read_iso_packets(
                &mut Cursor::new(raw),
                submit.number_of_packets as usize,
            )
            .unwrap();
        }
    }
    (reply, data, iso)
}

fn bulk_in(seqnum: u32, ep: u32, len: i32) -> SubmitCmd {
    SubmitCmd {
        seqnum,
        devid: 0x0003_0004,
        direction: Direction::In,
        ep,
        transfer_flags: 0,
        transfer_buffer_length: len,
        start_frame: 0,
        number_of_packets: 0,
        interval: 0,
        setup: [0u8; 8],
    }
}

fn get_descriptor(seqnum: u32) -> SubmitCmd {
    SubmitCmd {
        seqnum,
        devid: 0x0003_0004,
        direction: Direction::In,
        ep: 0,
        transfer_flags: 0,
        transfer_buffer_length: 18,
        start_frame: 0,
        number_of_packets: 0,
        interval: 0,
        setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(TEST_DEADLINE, async {
        while !condition() {
            tokio::time::sleep(TICK).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_devlist_shows_shared_only() {
    let server =
        TestServer::start(MockDriver::new(), &["3-4", "3-5"], SessionLimits::default()).await;

    let mut stream = server.connect().await;
    assert!(request_devlist(&mut stream).await.is_empty());

    server.bind("3-4");
    // Same connection returns to AwaitingCommand after each DEVLIST.
    let devices = request_devlist(&mut stream).await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].bus_id.to_string(), "3-4");

    server.registry.unbind_bus_id("3-4".parse().unwrap()).unwrap();
    assert!(request_devlist(&mut stream).await.is_empty());
}

#[tokio::test]
async fn test_import_happy_path() {
    let server = TestServer::start(MockDriver::new(), &["3-4"], SessionLimits::default()).await;
    server.bind("3-4");

    let mut stream = server.connect().await;
    let (status, record) = request_import(&mut stream, "3-4").await;
    assert_eq!(status, 0);
    let record = record.unwrap();
    assert_eq!(record.bus_id.to_string(), "3-4");
    assert!(server.attached("3-4"));
}

#[tokio::test]
async fn test_import_unshared_is_rejected() {
    let server = TestServer::start(MockDriver::new(), &["3-4"], SessionLimits::default()).await;

    let mut stream = server.connect().await;
    let (status, record) = request_import(&mut stream, "3-4").await;
    assert_eq!(status, 1);
    assert!(record.is_none());
}

#[tokio::test]
async fn test_import_unplugged_shared_device_is_rejected() {
    let server = TestServer::start(MockDriver::new(), &["3-4"], SessionLimits::default()).await;
    server.bind("3-4");
    server.enumerator.remove("3-4".parse().unwrap());

    let mut stream = server.connect().await;
    let (status, _) = request_import(&mut stream, "3-4").await;
    assert_eq!(status, 1);
    assert!(!server.attached("3-4"));
}

#[tokio::test]
async fn test_double_attach_second_client_loses() {
    let server = TestServer::start(MockDriver::new(), &["3-4"], SessionLimits::default()).await;
    server.bind("3-4");

    let mut first = server.connect().await;
    let (status, _) = request_import(&mut first, "3-4").await;
    assert_eq!(status, 0);

    let mut second = server.connect().await;
    let (status, _) = request_import(&mut second, "3-4").await;
    assert_eq!(status, 1);
}

#[tokio::test]
async fn test_bad_version_is_rejected() {
    let server = TestServer::start(MockDriver::new(), &["3-4"], SessionLimits::default()).await;

    let mut stream = server.connect().await;
    let stale = OpHeader {
        version: 0x0106,
        code: OP_DEVLIST,
        status: 0,
    };
    let mut buf = Vec::new();
    stale.write_to(&mut buf).unwrap();
    stream.write_all(&buf).await.unwrap();

    let mut raw = [0u8; OpHeader::SIZE];
    stream.read_exact(&mut raw).await.unwrap();
    let reply = OpHeader::read_from(&mut Cursor::new(&raw[..])).unwrap();
    assert_eq!(reply.status, 1);

    // Connection closes after the error reply.
    assert_eq!(stream.read(&mut [0u8; 1]).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_op_code_is_rejected() {
    let server = TestServer::start(MockDriver::new(), &["3-4"], SessionLimits::default()).await;

    let mut stream = server.connect().await;
    let mut buf = Vec::new();
    OpHeader::request(0x80ff).write_to(&mut buf).unwrap();
    stream.write_all(&buf).await.unwrap();

    let mut raw = [0u8; OpHeader::SIZE];
    stream.read_exact(&mut raw).await.unwrap();
    let reply = OpHeader::read_from(&mut Cursor::new(&raw[..])).unwrap();
    assert_eq!(reply.status, 1);
    assert_eq!(stream.read(&mut [0u8; 1]).await.unwrap(), 0);
}

#[tokio::test]
async fn test_control_get_descriptor_roundtrip() {
    let server = TestServer::start(MockDriver::new(), &["3-4"], SessionLimits::default()).await;
    server.bind("3-4");

    let mut stream = server.connect().await;
    let (status, _) = request_import(&mut stream, "3-4").await;
    assert_eq!(status, 0);

    send_submit(&mut stream, get_descriptor(1), &[]).await;

    let (reply, data, _) = timeout(TEST_DEADLINE, read_reply(&mut stream)).await.unwrap();
    let UrbReply::Submit(submit) = reply else {
        panic!("expected RET_SUBMIT, got {reply:?}");
    };
    assert_eq!(submit.seqnum, 1);
    assert_eq!(submit.status, 0);
    assert_eq!(submit.actual_length, 18);
    assert_eq!(&data[..2], &[0x12, 0x01]);
}

#[tokio::test]
async fn test_bulk_out_and_in() {
    let server = TestServer::start(MockDriver::new(), &["3-4"], SessionLimits::default()).await;
    server.bind("3-4");

    let mut stream = server.connect().await;
    request_import(&mut stream, "3-4").await;

    // OUT carries its payload after the header.
    let payload = vec![0xabu8; 512];
    let mut out = bulk_in(1, 2, 512);
    out.direction = Direction::Out;
    send_submit(&mut stream, out, &payload).await;

    let (reply, data, _) = read_reply(&mut stream).await;
    let UrbReply::Submit(submit) = reply else {
        panic!("expected RET_SUBMIT");
    };
    assert_eq!(submit.status, 0);
    assert_eq!(submit.actual_length, 512);
    assert!(data.is_empty());

    send_submit(&mut stream, bulk_in(2, 1, 256), &[]).await;
    let (reply, data, _) = read_reply(&mut stream).await;
    let UrbReply::Submit(submit) = reply else {
        panic!("expected RET_SUBMIT");
    };
    assert_eq!(submit.seqnum, 2);
    assert_eq!(submit.actual_length, 256);
    assert_eq!(data.len(), 256);
}

#[tokio::test]
async fn test_stalled_endpoint_maps_to_epipe() {
    let driver = MockDriver::new().with_stalled_endpoint(1);
    let server = TestServer::start(driver, &["3-4"], SessionLimits::default()).await;
    server.bind("3-4");

    let mut stream = server.connect().await;
    request_import(&mut stream, "3-4").await;

    send_submit(&mut stream, bulk_in(5, 1, 64), &[]).await;
    let (reply, _, _) = read_reply(&mut stream).await;
    let UrbReply::Submit(submit) = reply else {
        panic!("expected RET_SUBMIT");
    };
    assert_eq!(submit.status, -errno::EPIPE);
    assert_eq!(submit.actual_length, 0);
}

#[tokio::test]
async fn test_unlink_in_flight_suppresses_ret_submit() {
    let driver = MockDriver::new().with_bulk_delay(Duration::from_millis(200));
    let server = TestServer::start(driver, &["3-4"], SessionLimits::default()).await;
    server.bind("3-4");

    let mut stream = server.connect().await;
    request_import(&mut stream, "3-4").await;

    send_submit(&mut stream, bulk_in(7, 1, 512), &[]).await;
    send_unlink(&mut stream, 8, 7).await;

    let (reply, _, _) = timeout(TEST_DEADLINE, read_reply(&mut stream)).await.unwrap();
    let UrbReply::Unlink(unlink) = reply else {
        panic!("expected RET_UNLINK, got {reply:?}");
    };
    assert_eq!(unlink.seqnum, 8);
    assert_eq!(unlink.status, -errno::ECONNRESET);

    // The unlinked URB produced no RET_SUBMIT; the next frame on the wire
    // answers this fresh control request.
    send_submit(&mut stream, get_descriptor(9), &[]).await;
    let (reply, _, _) = timeout(TEST_DEADLINE, read_reply(&mut stream)).await.unwrap();
    let UrbReply::Submit(submit) = reply else {
        panic!("expected RET_SUBMIT, got {reply:?}");
    };
    assert_eq!(submit.seqnum, 9);
}

#[tokio::test]
async fn test_unlink_unknown_seqnum_reports_zero() {
    let server = TestServer::start(MockDriver::new(), &["3-4"], SessionLimits::default()).await;
    server.bind("3-4");

    let mut stream = server.connect().await;
    request_import(&mut stream, "3-4").await;

    send_unlink(&mut stream, 3, 999).await;
    let (reply, _, _) = read_reply(&mut stream).await;
    let UrbReply::Unlink(unlink) = reply else {
        panic!("expected RET_UNLINK");
    };
    assert_eq!(unlink.status, 0);
}

#[tokio::test]
async fn test_unlink_completed_urb_reports_zero() {
    let server = TestServer::start(MockDriver::new(), &["3-4"], SessionLimits::default()).await;
    server.bind("3-4");

    let mut stream = server.connect().await;
    request_import(&mut stream, "3-4").await;

    send_submit(&mut stream, get_descriptor(1), &[]).await;
    let (reply, _, _) = read_reply(&mut stream).await;
    assert!(matches!(reply, UrbReply::Submit(s) if s.seqnum == 1));

    send_unlink(&mut stream, 2, 1).await;
    let (reply, _, _) = read_reply(&mut stream).await;
    let UrbReply::Unlink(unlink) = reply else {
        panic!("expected RET_UNLINK");
    };
    assert_eq!(unlink.status, 0);
}

#[tokio::test]
async fn test_isochronous_roundtrip() {
    let server = TestServer::start(MockDriver::new(), &["3-4"], SessionLimits::default()).await;
    server.bind("3-4");

    let mut stream = server.connect().await;
    request_import(&mut stream, "3-4").await;

    let packets = [
        IsoPacket {
            offset: 0,
            length: 192,
            actual_length: 0,
            status: 0,
        },
        IsoPacket {
            offset: 192,
            length: 192,
            actual_length: 0,
            status: 0,
        },
    ];
    let cmd = SubmitCmd {
        seqnum: 11,
        devid: 0x0003_0004,
        direction: Direction::In,
        ep: 3,
        transfer_flags: 0,
        transfer_buffer_length: 384,
        start_frame: 50,
        number_of_packets: 2,
        interval: 1,
        setup: [0u8; 8],
    };
    let mut frame = UrbCommand::Submit(cmd).encode().to_vec();
    protocol::urb::write_iso_packets(&mut frame, &packets).unwrap();
    stream.write_all(&frame).await.unwrap();

    let (reply, data, iso) = read_reply(&mut stream).await;
    let UrbReply::Submit(submit) = reply else {
        panic!("expected RET_SUBMIT");
    };
    assert_eq!(submit.seqnum, 11);
    assert_eq!(submit.number_of_packets, 2);
    assert_eq!(data.len(), 384);
    assert_eq!(iso.len(), 2);
    assert!(iso.iter().all(|p| p.actual_length == 192));
}

#[tokio::test]
async fn test_oversized_transfer_closes_session() {
    let limits = SessionLimits {
        max_transfer_len: 1024,
        ..SessionLimits::default()
    };
    let server = TestServer::start(MockDriver::new(), &["3-4"], limits).await;
    server.bind("3-4");

    let mut stream = server.connect().await;
    request_import(&mut stream, "3-4").await;

    send_submit(&mut stream, bulk_in(1, 1, 4096), &[]).await;

    // Protocol error: no reply, the session just closes.
    let n = timeout(TEST_DEADLINE, stream.read(&mut [0u8; 64]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
    wait_until(|| !server.attached("3-4")).await;
}

#[tokio::test]
async fn test_disconnect_cancels_in_flight_and_detaches() {
    let driver = MockDriver::new().with_bulk_delay(Duration::from_millis(100));
    let server = TestServer::start(driver, &["3-4"], SessionLimits::default()).await;
    server.bind("3-4");

    let mut stream = server.connect().await;
    request_import(&mut stream, "3-4").await;
    assert!(server.attached("3-4"));

    for seqnum in 1..=4 {
        send_submit(&mut stream, bulk_in(seqnum, 1, 512), &[]).await;
    }
    drop(stream);

    // All in-flight URBs cancel and the registry returns to Unattached.
    wait_until(|| !server.attached("3-4")).await;

    // The device is importable again.
    let mut stream = server.connect().await;
    let (status, _) = request_import(&mut stream, "3-4").await;
    assert_eq!(status, 0);
}

#[tokio::test]
async fn test_completions_keep_seqnum_correlation_across_endpoints() {
    // Slow endpoint 1, fast endpoint 2: completion order differs from
    // submission order, seqnums keep the correlation.
    let driver = MockDriver::new().with_bulk_delay(Duration::from_millis(150));
    let server = TestServer::start(driver, &["3-4"], SessionLimits::default()).await;
    server.bind("3-4");

    let mut stream = server.connect().await;
    request_import(&mut stream, "3-4").await;

    send_submit(&mut stream, bulk_in(21, 1, 64), &[]).await;
    send_submit(&mut stream, get_descriptor(22), &[]).await;

    let (first, _, _) = read_reply(&mut stream).await;
    let (second, _, _) = read_reply(&mut stream).await;
    let seqnums: Vec<u32> = [first, second]
        .iter()
        .map(|r| match r {
            UrbReply::Submit(s) => s.seqnum,
            UrbReply::Unlink(u) => u.seqnum,
        })
        .collect();
    assert_eq!(seqnums, vec![22, 21]);
}

#[tokio::test]
async fn test_listener_shutdown_cancels_sessions() {
    let server = TestServer::start(MockDriver::new(), &["3-4"], SessionLimits::default()).await;
    server.bind("3-4");

    let mut stream = server.connect().await;
    request_import(&mut stream, "3-4").await;
    assert!(server.attached("3-4"));

    server.shutdown.send(true).unwrap();
    wait_until(|| !server.attached("3-4")).await;
}
