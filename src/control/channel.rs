//! Control connection writer
//!
//! `ControlChannel` outlives individual sessions. The lifecycle controller
//! attaches the control connection after the handshake and detaches it on
//! teardown. Each message is written whole while holding the channel lock,
//! so concurrent callers never interleave bytes on the wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::control::types::{Action, ControlMessage, PowerMode};
use crate::error::{ControlError, ControlResult, MirrorError};
use crate::transport::BoxedConnection;
use crate::video::Resolution;

/// Receives write failures; the controller stops the session in response
pub type ErrorReporter = Arc<dyn Fn(MirrorError) + Send + Sync>;

/// Control channel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlStats {
    /// Messages fully written
    pub messages_sent: u64,
    /// Bytes fully written
    pub bytes_sent: u64,
    /// Messages dropped without a connection, a screen size or a valid payload
    pub messages_dropped: u64,
}

#[derive(Default)]
struct Counters {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

struct ControlWriter {
    stream: BoxedConnection,
    token: CancellationToken,
}

/// Single-writer sender for control messages
pub struct ControlChannel {
    writer: Mutex<Option<ControlWriter>>,
    token: StdMutex<Option<CancellationToken>>,
    resolution: watch::Receiver<Option<Resolution>>,
    on_error: StdMutex<Option<ErrorReporter>>,
    counters: Counters,
}

impl ControlChannel {
    /// Creates a detached channel reading the screen size from `resolution`
    pub fn new(resolution: watch::Receiver<Option<Resolution>>) -> Self {
        Self {
            writer: Mutex::new(None),
            token: StdMutex::new(None),
            resolution,
            on_error: StdMutex::new(None),
            counters: Counters::default(),
        }
    }

    /// Sets the callback notified when a write fails
    pub fn set_error_reporter(&self, reporter: ErrorReporter) {
        if let Ok(mut slot) = self.on_error.lock() {
            *slot = Some(reporter);
        }
    }

    /// Starts writing to `stream`, replacing any previous connection
    ///
    /// Returns the token of this attachment. Passing it to `release` closes
    /// this connection without touching a later one.
    pub async fn attach(&self, stream: BoxedConnection) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut slot) = self.token.lock() {
            if let Some(previous) = slot.replace(token.clone()) {
                previous.cancel();
            }
        }

        let mut writer = self.writer.lock().await;
        *writer = Some(ControlWriter {
            stream,
            token: token.clone(),
        });
        debug!("Control connection attached");
        token
    }

    /// Releases the current connection
    ///
    /// Never blocks. A write in progress is cancelled and drops the
    /// connection itself when it notices.
    pub fn detach(&self) {
        if let Ok(mut slot) = self.token.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
        self.drop_cancelled_writer();
    }

    /// Releases the attachment identified by `token`, if it is still current
    pub fn release(&self, token: &CancellationToken) {
        token.cancel();
        if let Ok(mut slot) = self.token.lock() {
            if slot.as_ref().is_some_and(CancellationToken::is_cancelled) {
                slot.take();
            }
        }
        self.drop_cancelled_writer();
    }

    fn drop_cancelled_writer(&self) {
        match self.writer.try_lock() {
            Ok(mut writer) => {
                if writer.as_ref().is_some_and(|w| w.token.is_cancelled()) {
                    writer.take();
                    debug!("Control connection detached");
                }
            }
            Err(_) => debug!("Control write in progress, connection closes when it ends"),
        }
    }

    /// Whether a connection is attached
    pub fn is_attached(&self) -> bool {
        self.token
            .lock()
            .map(|t| t.as_ref().is_some_and(|t| !t.is_cancelled()))
            .unwrap_or(false)
    }

    /// Returns the counters
    pub fn stats(&self) -> ControlStats {
        ControlStats {
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            messages_dropped: self.counters.messages_dropped.load(Ordering::Relaxed),
        }
    }

    /// Presses or releases a key
    pub async fn keycode(&self, action: Action, keycode: i32) {
        self.send(ControlMessage::keycode(action, keycode)).await;
    }

    /// Presses and releases a key
    pub async fn tap_key(&self, keycode: i32) {
        self.keycode(Action::Down, keycode).await;
        self.keycode(Action::Up, keycode).await;
    }

    /// Types text
    pub async fn text(&self, text: &str) {
        match ControlMessage::text(text) {
            Ok(message) => self.send(message).await,
            Err(e) => self.reject(e),
        }
    }

    /// Sends a touch at device coordinates
    pub async fn touch(&self, action: Action, x: i32, y: i32) {
        let Some(screen) = self.screen_size() else {
            return;
        };
        self.send(ControlMessage::touch(action, x, y, screen)).await;
    }

    /// Scrolls at device coordinates
    pub async fn scroll(&self, x: i32, y: i32, hscroll: i32, vscroll: i32) {
        let Some(screen) = self.screen_size() else {
            return;
        };
        self.send(ControlMessage::scroll(x, y, screen, hscroll, vscroll))
            .await;
    }

    /// Presses back, or turns the screen on
    pub async fn back_or_screen_on(&self, action: Action) {
        self.send(ControlMessage::BackOrScreenOn(action)).await;
    }

    /// Opens the notification panel
    pub async fn expand_notification_panel(&self) {
        self.send(ControlMessage::ExpandNotificationPanel).await;
    }

    /// Opens the quick settings panel
    pub async fn expand_settings_panel(&self) {
        self.send(ControlMessage::ExpandSettingsPanel).await;
    }

    /// Closes open panels
    pub async fn collapse_panels(&self) {
        self.send(ControlMessage::CollapsePanels).await;
    }

    /// Sets the device clipboard, optionally pasting it
    pub async fn set_clipboard(&self, text: &str, paste: bool) {
        match ControlMessage::set_clipboard(text, paste) {
            Ok(message) => self.send(message).await,
            Err(e) => self.reject(e),
        }
    }

    /// Turns the device display on or off
    pub async fn set_screen_power_mode(&self, mode: PowerMode) {
        self.send(ControlMessage::SetScreenPowerMode(mode)).await;
    }

    /// Rotates the device
    pub async fn rotate_device(&self) {
        self.send(ControlMessage::RotateDevice).await;
    }

    /// Writes one message
    ///
    /// Failures are not returned. Oversized messages and messages sent
    /// without a connection are dropped; a broken connection is detached
    /// and reported.
    pub async fn send(&self, message: ControlMessage) {
        if let Err(e) = message.validate() {
            self.reject(e);
            return;
        }

        match self.write(&message).await {
            Ok(()) => {}
            Err(ControlError::NotConnected) => {
                self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("No control connection, dropped {:?}", message);
            }
            Err(e) => {
                warn!("Control write failed: {}", e);
                self.report(MirrorError::from(e));
            }
        }
    }

    async fn write(&self, message: &ControlMessage) -> ControlResult<()> {
        let bytes = message.serialize();
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ControlError::NotConnected)?;
        let token = writer.token.clone();
        if token.is_cancelled() {
            *guard = None;
            return Err(ControlError::NotConnected);
        }

        // Cancellation wins when both branches are ready
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = write_message(&mut writer.stream, &bytes) => Some(result),
        };

        match result {
            Some(Ok(())) => {
                if token.is_cancelled() {
                    *guard = None;
                }
            }
            Some(Err(e)) => {
                // Closed here, the lock is released before reporting
                token.cancel();
                *guard = None;
                return Err(ControlError::WriteFailed(e));
            }
            None => {
                *guard = None;
                return Err(ControlError::NotConnected);
            }
        }

        trace!("Sent control message {} ({} bytes)", message.opcode(), bytes.len());
        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn reject(&self, error: ControlError) {
        self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
        warn!("Dropping control message: {}", error);
    }

    fn screen_size(&self) -> Option<Resolution> {
        // Copied out so the watch lock is not held
        let resolution = *self.resolution.borrow();
        if resolution.is_none() {
            debug!("{}", ControlError::UnknownResolution);
            self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
        }
        resolution
    }

    fn report(&self, error: MirrorError) {
        let reporter = self.on_error.lock().ok().and_then(|r| r.clone());
        if let Some(reporter) = reporter {
            reporter(error);
        }
    }
}

async fn write_message(stream: &mut BoxedConnection, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(bytes).await?;
    stream.flush().await
}
