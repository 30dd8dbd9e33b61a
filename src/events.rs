//! Session event hub
//!
//! A typed publish/subscribe registry. Callbacks are grouped by
//! `EventKind` and invoked in subscription order on the publishing thread.
//! Callbacks run outside the registry lock, so a callback may subscribe,
//! unsubscribe or stop the client.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::error::MirrorError;
use crate::video::{DecodedFrame, Resolution};

/// Event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Handshake completed
    Init,
    /// A frame was decoded
    Frame,
    /// The video resolution changed
    Resized,
    /// The session ended
    Disconnect,
}

/// Event payloads
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Handshake completed
    Init {
        /// Device name reported by the server
        device_name: String,
        /// Resolution announced in the handshake
        resolution: Resolution,
    },
    /// A decoded frame
    Frame(DecodedFrame),
    /// New video resolution, published before the first frame at that size
    Resized(Resolution),
    /// The session ended, with the error that ended it if any
    Disconnect(Option<Arc<MirrorError>>),
}

impl ClientEvent {
    /// Returns the category of this event
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::Init { .. } => EventKind::Init,
            ClientEvent::Frame(_) => EventKind::Frame,
            ClientEvent::Resized(_) => EventKind::Resized,
            ClientEvent::Disconnect(_) => EventKind::Disconnect,
        }
    }
}

/// Subscription handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Event callback
pub type Listener = Arc<dyn Fn(ClientEvent) + Send + Sync>;

/// Registry of listeners per event category
#[derive(Default)]
pub struct EventHub {
    listeners: Mutex<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
}

impl EventHub {
    /// Creates an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for one category
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(ClientEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners
                .entry(kind)
                .or_default()
                .push((id, Arc::new(callback)));
        }
        trace!("Subscribed {} to {:?}", id, kind);
        id
    }

    /// Removes a callback; returns false if it was not registered
    pub fn unsubscribe(&self, kind: EventKind, id: ListenerId) -> bool {
        let Ok(mut listeners) = self.listeners.lock() else {
            return false;
        };
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };

        let before = list.len();
        list.retain(|(listener_id, _)| *listener_id != id);
        before != list.len()
    }

    /// Number of callbacks registered for a category
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .lock()
            .map(|l| l.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Delivers an event to every callback of its category
    ///
    /// The last callback receives the event itself, the others a clone.
    pub fn publish(&self, event: ClientEvent) {
        let kind = event.kind();
        let snapshot: Vec<Listener> = match self.listeners.lock() {
            Ok(listeners) => listeners
                .get(&kind)
                .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default(),
            Err(_) => return,
        };

        let Some((last, rest)) = snapshot.split_last() else {
            return;
        };
        for callback in rest {
            callback(event.clone());
        }
        last(event);
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("init", &self.listener_count(EventKind::Init))
            .field("frame", &self.listener_count(EventKind::Frame))
            .field("resized", &self.listener_count(EventKind::Resized))
            .field("disconnect", &self.listener_count(EventKind::Disconnect))
            .finish()
    }
}
