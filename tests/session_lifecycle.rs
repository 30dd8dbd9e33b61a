//! Integration tests for the mirroring session lifecycle
//!
//! These tests drive `MirrorClient` against an in-memory device:
//! - Handshake and init delivery
//! - Frame and resize events from the decode worker
//! - Stop idempotence and teardown on socket or control failures
//! - Device changes on idle and streaming clients
//! - Decoder failures at startup and while streaming
//! - Cancelled starts racing a restart

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use droid_mirror::config::Config;
use droid_mirror::control::{keycode, Action};
use droid_mirror::error::{
    HandshakeError, MirrorError, TransportError, TransportResult, VideoError, VideoResult,
};
use droid_mirror::events::{ClientEvent, EventKind};
use droid_mirror::session::{ClientState, MirrorClient};
use droid_mirror::transport::{BoxedConnection, Transport};
use droid_mirror::video::{DecodedFrame, DecoderFactory, FrameDecoder, Resolution};

/// What a fake device sends on its video connection
#[derive(Clone)]
struct DeviceScript {
    name: &'static str,
    size: (u16, u16),
    dummy: u8,
    video: Vec<u8>,
    close_video: bool,
}

impl DeviceScript {
    fn new(name: &'static str, size: (u16, u16), units: usize) -> Self {
        Self {
            name,
            size,
            dummy: 0,
            video: idr_stream(units),
            close_video: false,
        }
    }

    fn header(&self) -> Vec<u8> {
        let mut bytes = vec![self.dummy];
        let mut field = self.name.as_bytes().to_vec();
        field.resize(64, 0);
        bytes.extend_from_slice(&field);
        bytes.extend_from_slice(&self.size.0.to_be_bytes());
        bytes.extend_from_slice(&self.size.1.to_be_bytes());
        bytes
    }
}

/// In-memory stand-in for the debugging bridge
#[derive(Default)]
struct FakeTransport {
    devices: Mutex<HashMap<String, DeviceScript>>,
    video_opened: AtomicBool,
    never_listening: AtomicBool,
    /// Delays the next server launch
    launch_delay: Mutex<Option<Duration>>,
    video_remotes: Mutex<Vec<DuplexStream>>,
    control_remote: Mutex<Option<DuplexStream>>,
    executed: Mutex<Vec<Vec<String>>>,
}

impl FakeTransport {
    fn with_device(serial: &str, script: DeviceScript) -> Arc<Self> {
        let transport = Arc::new(Self::default());
        transport.add_device(serial, script);
        transport
    }

    fn add_device(&self, serial: &str, script: DeviceScript) {
        self.devices
            .lock()
            .unwrap()
            .insert(serial.to_string(), script);
    }

    fn take_control_remote(&self) -> DuplexStream {
        self.control_remote
            .lock()
            .unwrap()
            .take()
            .expect("control connection was not opened")
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn resolve_device(&self, serial: &str) -> TransportResult<()> {
        if self.devices.lock().unwrap().contains_key(serial) {
            Ok(())
        } else {
            Err(TransportError::DeviceNotFound(serial.to_string()))
        }
    }

    async fn open_named_connection(
        &self,
        serial: &str,
        name: &str,
    ) -> TransportResult<BoxedConnection> {
        if self.never_listening.load(Ordering::SeqCst) {
            return Err(TransportError::NotAvailable(name.to_string()));
        }
        let script = self
            .devices
            .lock()
            .unwrap()
            .get(serial)
            .cloned()
            .ok_or_else(|| TransportError::DeviceNotFound(serial.to_string()))?;

        // The server accepts video first, then control
        if self.video_opened.swap(true, Ordering::SeqCst) {
            let (local, remote) = tokio::io::duplex(64 * 1024);
            *self.control_remote.lock().unwrap() = Some(remote);
            return Ok(Box::new(local));
        }

        let (local, mut remote) = tokio::io::duplex(1024 * 1024);
        remote.write_all(&script.header()).await?;
        remote.write_all(&script.video).await?;
        if !script.close_video {
            self.video_remotes.lock().unwrap().push(remote);
        }
        Ok(Box::new(local))
    }

    async fn push_file(&self, _serial: &str, _local: &Path, _remote: &str) -> TransportResult<()> {
        Ok(())
    }

    async fn execute(&self, _serial: &str, argv: &[String]) -> TransportResult<BoxedConnection> {
        let delay = self.launch_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.video_opened.store(false, Ordering::SeqCst);
        self.executed.lock().unwrap().push(argv.to_vec());
        let (local, _remote) = tokio::io::duplex(64);
        Ok(Box::new(local))
    }
}

/// Emits one frame per access unit with the scripted sizes
struct ScriptedDecoder {
    sizes: VecDeque<(u32, u32)>,
}

impl FrameDecoder for ScriptedDecoder {
    fn decode(&mut self, _unit: &[u8]) -> VideoResult<Vec<DecodedFrame>> {
        Ok(self
            .sizes
            .pop_front()
            .map(|(w, h)| vec![DecodedFrame::filled(w, h, 16)])
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Fails every access unit with an unrecoverable error
struct BrokenDecoder;

impl FrameDecoder for BrokenDecoder {
    fn decode(&mut self, _unit: &[u8]) -> VideoResult<Vec<DecodedFrame>> {
        Err(VideoError::DecoderInit("codec lost".to_string()))
    }

    fn name(&self) -> &'static str {
        "broken"
    }
}

fn scripted_decoder(sizes: &[(u32, u32)]) -> DecoderFactory {
    let sizes = sizes.to_vec();
    Arc::new(move || {
        Ok(Box::new(ScriptedDecoder {
            sizes: sizes.clone().into(),
        }) as Box<dyn FrameDecoder>)
    })
}

/// Single-slice IDR access units; the last one stays buffered until more data
fn idr_stream(units: usize) -> Vec<u8> {
    let mut stream = Vec::new();
    for _ in 0..units {
        stream.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1F]);
        stream.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE, 0x38, 0x80]);
        stream.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21]);
    }
    stream
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.connection.connection_timeout_ms = 300;
    config
}

fn client(serial: &str, transport: Arc<FakeTransport>, sizes: &[(u32, u32)]) -> MirrorClient {
    MirrorClient::with_decoder_factory(serial, test_config(), transport, scripted_decoder(sizes))
}

/// Records every event as a line of text
fn record(client: &MirrorClient) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        EventKind::Init,
        EventKind::Frame,
        EventKind::Resized,
        EventKind::Disconnect,
    ] {
        let log = log.clone();
        client.events().subscribe(kind, move |event| {
            let line = match event {
                ClientEvent::Init {
                    device_name,
                    resolution,
                } => format!("init {} {}", device_name, resolution),
                ClientEvent::Frame(frame) => format!("frame {} {}", frame.sequence, frame.resolution()),
                ClientEvent::Resized(resolution) => format!("resized {}", resolution),
                ClientEvent::Disconnect(None) => "disconnect".to_string(),
                ClientEvent::Disconnect(Some(e)) => format!("disconnect: {}", e),
            };
            log.lock().unwrap().push(line);
        });
    }
    log
}

async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn count(log: &Arc<Mutex<Vec<String>>>, prefix: &str) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .filter(|l| l.starts_with(prefix))
        .count()
}

/// Tests the happy path from handshake to explicit stop
#[tokio::test]
async fn test_start_stream_and_stop() {
    let transport = FakeTransport::with_device("abc", DeviceScript::new("phone1", (1280, 720), 4));
    let client = client("abc", transport.clone(), &[(1280, 720), (720, 1280), (720, 1280)]);
    let log = record(&client);

    client.start().await.expect("start should succeed");
    assert_eq!(client.state(), ClientState::Streaming);
    assert!(client.is_alive());
    assert_eq!(client.device_name().as_deref(), Some("phone1"));

    wait_for("three frames", || count(&log, "frame") == 3).await;
    assert_eq!(client.resolution(), Some(Resolution::new(720, 1280)));

    client.stop();
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(!client.is_alive());

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "init phone1 1280x720",
            "frame 1 1280x720",
            "resized 720x1280",
            "frame 2 720x1280",
            "frame 3 720x1280",
            "disconnect",
        ]
    );
    assert_eq!(client.pipeline_stats().frames_decoded, 3);

    let executed = transport.executed.lock().unwrap();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0][4], "1.20");
}

/// Tests that stopping twice publishes a single disconnect
#[tokio::test]
async fn test_double_stop() {
    let transport = FakeTransport::with_device("abc", DeviceScript::new("phone1", (1280, 720), 0));
    let client = client("abc", transport, &[]);
    let log = record(&client);

    client.start().await.unwrap();
    client.stop();
    client.stop();

    assert_eq!(count(&log, "disconnect"), 1);
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(!client.control().is_attached());
}

/// Tests that stop before start is a no-op
#[tokio::test]
async fn test_stop_before_start() {
    let transport = Arc::new(FakeTransport::default());
    let client = client("abc", transport, &[]);
    let log = record(&client);

    client.stop();
    assert_eq!(client.state(), ClientState::Idle);
    assert!(log.lock().unwrap().is_empty());
}

/// Tests that a bad dummy byte fails start without a disconnect event
#[tokio::test]
async fn test_handshake_failure() {
    let mut script = DeviceScript::new("phone1", (1280, 720), 0);
    script.dummy = 0x01;
    let transport = FakeTransport::with_device("abc", script);
    let client = client("abc", transport, &[]);
    let log = record(&client);

    let err = client.start().await.unwrap_err();
    assert!(matches!(
        err,
        MirrorError::Handshake(HandshakeError::UnexpectedDummyByte(1))
    ));
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(client.device_name().is_none());
    assert!(log.lock().unwrap().is_empty());
}

/// Tests the bounded retry window when the server never listens
#[tokio::test]
async fn test_connection_timeout() {
    let transport = FakeTransport::with_device("abc", DeviceScript::new("phone1", (1280, 720), 0));
    transport.never_listening.store(true, Ordering::SeqCst);
    let client = client("abc", transport, &[]);

    let err = client.start().await.unwrap_err();
    assert!(matches!(err, MirrorError::ConnectionTimeout(_)));
    assert_eq!(client.state(), ClientState::Disconnected);
}

/// Tests that start is rejected while a session is streaming
#[tokio::test]
async fn test_start_while_streaming() {
    let transport = FakeTransport::with_device("abc", DeviceScript::new("phone1", (1280, 720), 0));
    let client = client("abc", transport, &[]);

    client.start().await.unwrap();
    assert!(matches!(
        client.start().await,
        Err(MirrorError::InvalidState(_))
    ));
    client.stop();
}

/// Tests that the device closing the video connection ends the session
#[tokio::test]
async fn test_video_eof_disconnects_with_error() {
    let mut script = DeviceScript::new("phone1", (1280, 720), 2);
    script.close_video = true;
    let transport = FakeTransport::with_device("abc", script);
    let client = client("abc", transport, &[(1280, 720)]);
    let log = record(&client);

    client.start().await.unwrap();
    wait_for("disconnect", || count(&log, "disconnect") == 1).await;

    assert_eq!(client.state(), ClientState::Disconnected);
    let error = client.last_error().expect("error should be recorded");
    assert!(matches!(*error, MirrorError::Socket(_)));

    let log = log.lock().unwrap();
    assert_eq!(log[0], "init phone1 1280x720");
    assert!(log.last().unwrap().starts_with("disconnect: Socket error"));
}

/// Tests that control messages reach the device connection
#[tokio::test]
async fn test_control_messages() {
    let transport = FakeTransport::with_device("abc", DeviceScript::new("phone1", (1280, 720), 0));
    let client = client("abc", transport.clone(), &[]);
    client.start().await.unwrap();
    let mut remote = transport.take_control_remote();

    client.control().keycode(Action::Down, keycode::HOME).await;
    client.control().touch(Action::Up, -4, 9).await;

    let mut buf = [0u8; 14 + 28];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf[..6], &[0, 0, 0, 0, 0, 3]);
    assert_eq!(buf[14], 2);
    // Clamped x, then y and the handshake screen size
    assert_eq!(&buf[24..36], &[0, 0, 0, 0, 0, 0, 0, 9, 0x05, 0x00, 0x02, 0xD0]);

    client.stop();
}

/// Tests that a broken control connection stops the session
#[tokio::test]
async fn test_control_failure_disconnects() {
    let transport = FakeTransport::with_device("abc", DeviceScript::new("phone1", (1280, 720), 0));
    let client = client("abc", transport.clone(), &[]);
    let log = record(&client);
    client.start().await.unwrap();

    drop(transport.take_control_remote());
    client.control().rotate_device().await;

    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(matches!(
        client.last_error().as_deref(),
        Some(MirrorError::ControlSend(_))
    ));
    assert_eq!(count(&log, "disconnect: Control send error"), 1);
}

/// Tests that rebinding an idle client emits nothing
#[tokio::test]
async fn test_change_device_when_idle() {
    let transport = FakeTransport::with_device("abc", DeviceScript::new("phone1", (1280, 720), 0));
    transport.add_device("def", DeviceScript::new("tablet", (1920, 1200), 0));
    let client = client("abc", transport, &[]);
    let log = record(&client);

    client.change_device("def").await.unwrap();
    assert_eq!(client.serial(), "def");
    assert_eq!(client.state(), ClientState::Idle);
    assert!(log.lock().unwrap().is_empty());

    let err = client.change_device("missing").await.unwrap_err();
    assert!(matches!(err, MirrorError::DeviceNotFound(_)));
    assert_eq!(client.serial(), "def");
}

/// Tests that changing device while streaming restarts on the new device
#[tokio::test]
async fn test_change_device_when_streaming() {
    let transport = FakeTransport::with_device("abc", DeviceScript::new("phone1", (1280, 720), 0));
    transport.add_device("def", DeviceScript::new("tablet", (1920, 1200), 0));
    let client = client("abc", transport, &[]);
    let log = record(&client);

    client.start().await.unwrap();
    client.change_device("def").await.unwrap();

    assert_eq!(client.state(), ClientState::Streaming);
    assert_eq!(client.device_name().as_deref(), Some("tablet"));
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "init phone1 1280x720",
            "disconnect",
            "init tablet 1920x1200",
        ]
    );

    client.stop();
}

/// Tests that a client can be started again after a stop
#[tokio::test]
async fn test_restart_after_stop() {
    let transport = FakeTransport::with_device("abc", DeviceScript::new("phone1", (1280, 720), 3));
    let client = client("abc", transport, &[(1280, 720), (1280, 720)]);
    let log = record(&client);

    client.start().await.unwrap();
    wait_for("first session frames", || count(&log, "frame") == 2).await;
    client.stop();

    client.start().await.unwrap();
    wait_for("second session frames", || count(&log, "frame") == 4).await;
    client.stop();

    // Sequence numbers restart with each session
    assert_eq!(count(&log, "frame 1 "), 2);
    assert_eq!(count(&log, "init"), 2);
    assert_eq!(count(&log, "disconnect"), 2);
}

/// Tests that a start cancelled by stop leaves a later session intact
#[tokio::test]
async fn test_cancelled_start_does_not_disturb_next_session() {
    let transport = FakeTransport::with_device("abc", DeviceScript::new("phone1", (1280, 720), 0));
    *transport.launch_delay.lock().unwrap() = Some(Duration::from_millis(300));
    let client = client("abc", transport.clone(), &[]);
    let log = record(&client);

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.start().await }
    });
    wait_for("first launch", || client.state() == ClientState::Connecting).await;
    client.stop();
    assert_eq!(client.state(), ClientState::Disconnected);

    client.start().await.expect("second start should succeed");
    let mut remote = transport.take_control_remote();

    let first = pending.await.unwrap();
    assert!(matches!(first, Err(MirrorError::Cancelled)));

    assert_eq!(client.state(), ClientState::Streaming);
    assert_eq!(client.resolution(), Some(Resolution::new(1280, 720)));
    assert!(client.control().is_attached());

    client.control().touch(Action::Down, 3, 4).await;
    let mut buf = [0u8; 28];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf[0], 2);
    assert_eq!(&buf[18..22], &[0x05, 0x00, 0x02, 0xD0]);

    assert_eq!(*log.lock().unwrap(), vec!["init phone1 1280x720"]);
    client.stop();
}

/// Tests that a decoder that cannot be created fails start without events
#[tokio::test]
async fn test_decoder_init_failure_fails_start() {
    let transport = FakeTransport::with_device("abc", DeviceScript::new("phone1", (1280, 720), 2));
    let factory: DecoderFactory = Arc::new(|| Err(VideoError::DecoderInit("no codec".to_string())));
    let client = MirrorClient::with_decoder_factory("abc", test_config(), transport, factory);
    let log = record(&client);
    client.events().subscribe(EventKind::Init, |_| {
        std::thread::sleep(Duration::from_millis(5));
    });

    let err = client.start().await.unwrap_err();
    assert!(matches!(err, MirrorError::Decode(_)));
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(!client.is_alive());
    assert!(!client.control().is_attached());
    assert_eq!(client.resolution(), None);
    assert!(log.lock().unwrap().is_empty());

    // Nothing arrives later either
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(log.lock().unwrap().is_empty());
}

/// Tests that a fatal decode error while streaming ends the session
#[tokio::test]
async fn test_fatal_decode_error_disconnects() {
    let transport = FakeTransport::with_device("abc", DeviceScript::new("phone1", (1280, 720), 2));
    let factory: DecoderFactory = Arc::new(|| Ok(Box::new(BrokenDecoder) as Box<dyn FrameDecoder>));
    let client = MirrorClient::with_decoder_factory("abc", test_config(), transport, factory);
    let log = record(&client);

    client.start().await.unwrap();
    wait_for("disconnect", || count(&log, "disconnect") == 1).await;

    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(!client.control().is_attached());
    assert!(matches!(
        client.last_error().as_deref(),
        Some(MirrorError::Decode(_))
    ));

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0], "init phone1 1280x720");
    assert!(log[1].starts_with("disconnect: Decode error"));
    assert!(log[1].contains("codec lost"));
}
