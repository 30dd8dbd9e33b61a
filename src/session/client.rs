//! Mirroring client lifecycle
//!
//! `MirrorClient` owns one session at a time. `start` deploys the server
//! and performs the handshake, then hands the video connection to a reader
//! task that feeds the decode worker. `stop` tears everything down and
//! publishes `Disconnect`; it is synchronous and may be called from any
//! event callback, the decode worker or the reader task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::control::ControlChannel;
use crate::error::{MirrorError, Result, TransportError};
use crate::events::{ClientEvent, EventHub};
use crate::session::handshake::{self, Handshake};
use crate::session::state::{ClientState, ClientStateMachine};
use crate::transport::{BoxedConnection, Transport};
use crate::video::{
    h264_decoder_factory, ChunkSender, DecodeWorker, DecoderFactory, FatalErrorHandler,
    PipelineEvent, PipelineSink, PipelineStats, Resolution,
};

/// Resources owned by a streaming session
struct SessionResources {
    /// Server process stream, dropped to end the server
    server: BoxedConnection,
    reader: Option<JoinHandle<()>>,
    worker: Option<DecodeWorker>,
}

struct SessionSlot {
    state: ClientStateMachine,
    serial: String,
    device_name: Option<String>,
    /// Bumped by every start so late callbacks can tell sessions apart
    generation: u64,
    resources: Option<SessionResources>,
    last_error: Option<Arc<MirrorError>>,
    /// Set while `Init` is being delivered; failures wait for it
    init_pending: bool,
}

impl SessionSlot {
    fn is_connecting(&self, generation: u64) -> bool {
        self.generation == generation && self.state.current() == ClientState::Connecting
    }
}

struct ClientInner {
    config: Config,
    transport: Arc<dyn Transport>,
    decoder_factory: DecoderFactory,
    events: EventHub,
    control: Arc<ControlChannel>,
    resolution: watch::Sender<Option<Resolution>>,
    stats: Arc<RwLock<PipelineStats>>,
    alive: AtomicBool,
    slot: Mutex<SessionSlot>,
}

/// Android mirroring client
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct MirrorClient {
    inner: Arc<ClientInner>,
}

impl MirrorClient {
    /// Creates a client for the device `serial`
    pub fn new(serial: impl Into<String>, config: Config, transport: Arc<dyn Transport>) -> Self {
        Self::with_decoder_factory(serial, config, transport, h264_decoder_factory())
    }

    /// Creates a client using a custom decoder
    pub fn with_decoder_factory(
        serial: impl Into<String>,
        config: Config,
        transport: Arc<dyn Transport>,
        decoder_factory: DecoderFactory,
    ) -> Self {
        let (resolution, resolution_rx) = watch::channel(None);
        let control = Arc::new(ControlChannel::new(resolution_rx));

        let inner = Arc::new(ClientInner {
            config,
            transport,
            decoder_factory,
            events: EventHub::new(),
            control,
            resolution,
            stats: Arc::default(),
            alive: AtomicBool::new(false),
            slot: Mutex::new(SessionSlot {
                state: ClientStateMachine::new(),
                serial: serial.into(),
                device_name: None,
                generation: 0,
                resources: None,
                last_error: None,
                init_pending: false,
            }),
        });

        let weak = Arc::downgrade(&inner);
        inner.control.set_error_reporter(Arc::new(move |error| {
            if let Some(inner) = weak.upgrade() {
                let generation = inner.lock_slot().generation;
                inner.fail(generation, error);
            }
        }));

        Self { inner }
    }

    /// Event subscriptions
    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    /// Control channel of the current session
    pub fn control(&self) -> &Arc<ControlChannel> {
        &self.inner.control
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClientState {
        self.inner.lock_slot().state.current()
    }

    /// Whether a session is streaming
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Serial of the bound device
    pub fn serial(&self) -> String {
        self.inner.lock_slot().serial.clone()
    }

    /// Device name from the last handshake
    pub fn device_name(&self) -> Option<String> {
        self.inner.lock_slot().device_name.clone()
    }

    /// Current video resolution, unknown before the handshake
    pub fn resolution(&self) -> Option<Resolution> {
        *self.inner.resolution.borrow()
    }

    /// Error that ended the last session
    pub fn last_error(&self) -> Option<Arc<MirrorError>> {
        self.inner.lock_slot().last_error.clone()
    }

    /// Video statistics of the current session
    pub fn pipeline_stats(&self) -> PipelineStats {
        self.inner
            .stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Connects to the device and starts streaming
    ///
    /// Publishes `Init` on success. A failed handshake or decoder leaves
    /// the client `Disconnected` without publishing `Disconnect`.
    ///
    /// # Errors
    ///
    /// - `MirrorError::InvalidState` if a session is connecting or streaming
    /// - `MirrorError::ConnectionTimeout` or `MirrorError::Handshake` if the
    ///   server could not be reached
    /// - `MirrorError::Decode` if the decoder could not be created
    /// - `MirrorError::Cancelled` if `stop` was called meanwhile
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let (serial, generation) = {
            let mut slot = inner.lock_slot();
            let current = slot.state.current();
            if !current.can_start() {
                return Err(MirrorError::InvalidState(format!(
                    "cannot start while {}",
                    current
                )));
            }
            slot.state.transition(ClientState::Connecting)?;
            slot.generation += 1;
            slot.device_name = None;
            slot.last_error = None;
            slot.init_pending = false;
            (slot.serial.clone(), slot.generation)
        };
        info!("Connecting to {}", serial);

        let Handshake {
            server,
            video,
            control,
            info,
        } = match handshake::connect(inner.transport.as_ref(), &serial, &inner.config).await {
            Ok(handshake) => handshake,
            Err(e) => {
                error!("Handshake with {} failed: {}", serial, e);
                inner.abandon_start(generation);
                return Err(e);
            }
        };

        // A stale start must not touch the channel or watch a newer one owns
        {
            let slot = inner.lock_slot();
            if !slot.is_connecting(generation) {
                info!("Start on {} cancelled", serial);
                return Err(MirrorError::Cancelled);
            }
            inner.resolution.send_replace(Some(info.resolution));
            if let Ok(mut stats) = inner.stats.write() {
                *stats = PipelineStats::default();
            }
        }

        let control_token = match control {
            Some(control) => Some(inner.control.attach(control).await),
            None => None,
        };
        let worker = DecodeWorker::spawn(
            inner.decoder_factory.clone(),
            Some(info.resolution),
            inner.stats.clone(),
            pipeline_sink(Arc::downgrade(inner)),
            fatal_handler(Arc::downgrade(inner), generation),
        )
        .await;

        {
            let mut slot = inner.lock_slot();
            if !slot.is_connecting(generation) {
                if slot.generation == generation {
                    inner.resolution.send_replace(None);
                }
                drop(slot);
                if let Some(token) = &control_token {
                    inner.control.release(token);
                }
                if let Ok(worker) = worker {
                    if let Err(e) = worker.shutdown() {
                        warn!("Decode worker did not stop cleanly: {}", e);
                    }
                }
                info!("Start on {} cancelled", serial);
                return Err(MirrorError::Cancelled);
            }

            let worker = match worker {
                Ok(worker) => worker,
                Err(e) => {
                    slot.state.force_transition(ClientState::Disconnected);
                    inner.resolution.send_replace(None);
                    drop(slot);
                    if let Some(token) = &control_token {
                        inner.control.release(token);
                    }
                    error!("Could not start decoding: {}", e);
                    return Err(e.into());
                }
            };

            slot.state.transition(ClientState::Streaming)?;
            slot.device_name = Some(info.device_name.clone());
            slot.init_pending = true;
            slot.resources = Some(SessionResources {
                server,
                reader: None,
                worker: Some(worker),
            });
            inner.alive.store(true, Ordering::SeqCst);
        }

        inner.events.publish(ClientEvent::Init {
            device_name: info.device_name,
            resolution: info.resolution,
        });

        // Frames only flow once the reader runs, so Init is always first
        let mut slot = inner.lock_slot();
        if slot.generation != generation || slot.state.current() != ClientState::Streaming {
            debug!("Session ended during init, not reading video");
            return Ok(());
        }
        slot.init_pending = false;
        if slot.last_error.is_some() {
            drop(slot);
            inner.stop(Some(generation));
            return Ok(());
        }
        if let Some(resources) = slot.resources.as_mut() {
            if let Some(sender) = resources.worker.as_ref().map(DecodeWorker::sender) {
                resources.reader = Some(tokio::spawn(read_video(
                    video,
                    sender,
                    inner.config.connection.receive_buffer_size,
                    Arc::downgrade(inner),
                    generation,
                )));
            }
        }

        Ok(())
    }

    /// Ends the session
    ///
    /// Idempotent. Cancels a pending `start`. When a streaming session
    /// ends, `Disconnect` is published with the error that caused it, if
    /// any.
    pub fn stop(&self) {
        self.inner.stop(None);
    }

    /// Binds the client to another device
    ///
    /// A streaming session is stopped, publishing `Disconnect`, and started
    /// again on the new device. An idle client is only rebound.
    ///
    /// # Errors
    ///
    /// Returns `MirrorError::DeviceNotFound` if the device is not attached,
    /// or any `start` error when restarting
    pub async fn change_device(&self, serial: impl Into<String>) -> Result<()> {
        let serial = serial.into();
        let was_alive = self.is_alive();
        self.stop();

        match self.inner.transport.resolve_device(&serial).await {
            Ok(()) => {}
            Err(TransportError::DeviceNotFound(_)) => {
                warn!("Device {} not found", serial);
                return Err(MirrorError::DeviceNotFound(serial));
            }
            Err(e) => return Err(e.into()),
        }

        let previous = std::mem::replace(&mut self.inner.lock_slot().serial, serial.clone());
        info!("Device changed from {} to {}", previous, serial);

        if was_alive {
            self.start().await?;
        }
        Ok(())
    }
}

impl ClientInner {
    fn lock_slot(&self) -> MutexGuard<'_, SessionSlot> {
        // Poisoning is ignored, the slot only holds plain values
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a failed or cancelled start to `Disconnected`
    fn abandon_start(&self, generation: u64) {
        let mut slot = self.lock_slot();
        if slot.is_connecting(generation) {
            slot.state.force_transition(ClientState::Disconnected);
        }
    }

    /// Records a steady-state failure and stops that session
    fn fail(&self, generation: u64, error: MirrorError) {
        {
            let mut slot = self.lock_slot();
            if slot.generation != generation || slot.state.current() != ClientState::Streaming {
                debug!("Ignoring error from ended session: {}", error);
                return;
            }
            error!("Session with {} failed: {}", slot.serial, error);
            slot.last_error = Some(Arc::new(error));
            if slot.init_pending {
                debug!("Stopping once init is delivered");
                return;
            }
        }
        self.stop(Some(generation));
    }

    /// Stops the session, or only the given generation of it
    fn stop(&self, generation: Option<u64>) {
        let (resources, serial) = {
            let mut slot = self.lock_slot();
            if generation.is_some_and(|g| g != slot.generation) {
                return;
            }
            match slot.state.current() {
                ClientState::Idle | ClientState::Disconnected | ClientState::Disconnecting => {
                    debug!("Stop ignored while {}", slot.state.current());
                    return;
                }
                ClientState::Connecting => {
                    info!("Cancelling connection to {}", slot.serial);
                    slot.state.force_transition(ClientState::Disconnected);
                    return;
                }
                ClientState::Streaming => {}
            }
            slot.state.force_transition(ClientState::Disconnecting);
            self.alive.store(false, Ordering::SeqCst);
            (slot.resources.take(), slot.serial.clone())
        };
        info!("Disconnecting from {}", serial);

        // Each step runs regardless of the others
        self.control.detach();
        if let Some(resources) = resources {
            if let Some(reader) = resources.reader {
                reader.abort();
            }
            if let Some(worker) = resources.worker {
                if let Err(e) = worker.shutdown() {
                    warn!("Decode worker did not stop cleanly: {}", e);
                }
            }
            drop(resources.server);
        }
        self.resolution.send_replace(None);

        let last_error = {
            let mut slot = self.lock_slot();
            slot.state.force_transition(ClientState::Disconnected);
            slot.last_error.clone()
        };
        match &last_error {
            Some(e) => info!("Disconnected from {}: {}", serial, e),
            None => info!("Disconnected from {}", serial),
        }
        self.events.publish(ClientEvent::Disconnect(last_error));
    }
}

fn pipeline_sink(inner: Weak<ClientInner>) -> PipelineSink {
    Arc::new(move |event| {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            PipelineEvent::Resized(resolution) => {
                inner.resolution.send_replace(Some(resolution));
                inner.events.publish(ClientEvent::Resized(resolution));
            }
            PipelineEvent::Frame(frame) => inner.events.publish(ClientEvent::Frame(frame)),
        }
    })
}

fn fatal_handler(inner: Weak<ClientInner>, generation: u64) -> FatalErrorHandler {
    Arc::new(move |error| {
        if let Some(inner) = inner.upgrade() {
            inner.fail(generation, MirrorError::Decode(error.to_string()));
        }
    })
}

/// Drains the video connection into the decode queue
async fn read_video(
    mut video: BoxedConnection,
    sender: ChunkSender,
    buffer_size: usize,
    inner: Weak<ClientInner>,
    generation: u64,
) {
    let mut buf = BytesMut::with_capacity(buffer_size);

    let error = loop {
        buf.reserve(buffer_size);
        match video.read_buf(&mut buf).await {
            Ok(0) => break MirrorError::Socket("video connection closed by device".to_string()),
            Ok(_) => {
                if !sender.send(buf.split().freeze()) {
                    debug!("Decode queue closed, reader exiting");
                    return;
                }
            }
            Err(e) => break MirrorError::Socket(format!("video read failed: {}", e)),
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.fail(generation, error);
    }
}
