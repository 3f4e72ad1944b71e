//! Events surfaced to the presentation layer
//!
//! Every happening the UI cares about is one variant of [`RealtimeEvent`].
//! The [`EventDispatcher`] keeps an explicit table of listeners per
//! [`EventKind`] and, alongside it, a broadcast channel for consumers that
//! prefer an async stream.
//!
//! ```rust
//! use confab_realtime_core::events::{EventDispatcher, EventKind, RealtimeEvent};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let dispatcher = EventDispatcher::new(16);
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = seen.clone();
//! let id = dispatcher.add_listener(EventKind::CallState, move |_event: &RealtimeEvent| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//! assert_eq!(dispatcher.listener_count(EventKind::CallState), 1);
//! assert!(dispatcher.remove_listener(id));
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::call::{CallId, CallState};
use crate::message::{ChannelKey, ConnectionState, InboundMessage};

/// Where a connection status change came from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionSource {
    /// A message channel
    Channel(ChannelKey),
    /// The signaling transport
    Signaling,
}

/// Connection status reported to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Link down
    Disconnected,
    /// Link coming up
    Connecting,
    /// Link up
    Connected,
    /// Link or publish failure
    Error,
    /// Signaling registration accepted
    Registered,
    /// Signaling registration removed
    Unregistered,
    /// Signaling registration refused
    RegistrationFailed,
}

impl From<ConnectionState> for ConnectionStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Connected => ConnectionStatus::Connected,
            ConnectionState::Error => ConnectionStatus::Error,
        }
    }
}

/// A connection status change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatusInfo {
    /// Channel or signaling
    pub source: ConnectionSource,
    /// New status
    pub status: ConnectionStatus,
    /// Transport detail, if any
    pub detail: Option<String>,
    /// When the change was observed
    pub timestamp: DateTime<Utc>,
}

impl ConnectionStatusInfo {
    /// Status change observed now
    pub fn now(source: ConnectionSource, status: ConnectionStatus, detail: Option<String>) -> Self {
        Self {
            source,
            status,
            detail,
            timestamp: Utc::now(),
        }
    }
}

/// A call or registration state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStatusInfo {
    /// Call instance; `None` for registration changes
    pub call_id: Option<CallId>,
    /// State after the change
    pub new_state: CallState,
    /// State before the change, if there was one
    pub previous_state: Option<CallState>,
    /// Remote party of the call
    pub remote_identity: Option<String>,
    /// Failure detail or end cause
    pub reason: Option<String>,
    /// When the change happened
    pub timestamp: DateTime<Utc>,
}

/// An inbound call started ringing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCallInfo {
    /// Call instance
    pub call_id: CallId,
    /// Who is calling
    pub remote_identity: String,
    /// When the call arrived
    pub created_at: DateTime<Utc>,
}

/// Everything the realtime core reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RealtimeEvent {
    /// A new message was accepted on a channel
    MessageReceived {
        /// Channel the message arrived on
        key: ChannelKey,
        /// The message
        message: InboundMessage,
    },
    /// A channel or the signaling link changed status
    ConnectionStatusChanged(ConnectionStatusInfo),
    /// A call or the registration changed state
    CallStateChanged(CallStatusInfo),
    /// An inbound call is ringing
    IncomingCall(IncomingCallInfo),
}

impl RealtimeEvent {
    /// Kind used to select listeners
    pub fn kind(&self) -> EventKind {
        match self {
            RealtimeEvent::MessageReceived { .. } => EventKind::Message,
            RealtimeEvent::ConnectionStatusChanged(_) => EventKind::ConnectionStatus,
            RealtimeEvent::CallStateChanged(_) => EventKind::CallState,
            RealtimeEvent::IncomingCall(_) => EventKind::IncomingCall,
        }
    }
}

/// Listener table key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// [`RealtimeEvent::MessageReceived`]
    Message,
    /// [`RealtimeEvent::ConnectionStatusChanged`]
    ConnectionStatus,
    /// [`RealtimeEvent::CallStateChanged`]
    CallState,
    /// [`RealtimeEvent::IncomingCall`]
    IncomingCall,
}

/// Handle returned when a listener is added
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(u64);

/// Synchronous event listener
pub type Listener = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;

/// Stream of every dispatched event
pub type EventStream = BroadcastStream<RealtimeEvent>;

/// Fans events out to listeners and stream subscribers
pub struct EventDispatcher {
    listeners: RwLock<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<RealtimeEvent>,
}

impl EventDispatcher {
    /// Create a dispatcher whose stream buffers `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            sender,
        }
    }

    /// Register a listener for one kind of event
    pub fn add_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        for entries in listeners.values_mut() {
            if let Some(pos) = entries.iter().position(|(existing, _)| *existing == id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    /// Number of listeners registered for `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Deliver an event to its listeners, then to stream subscribers
    ///
    /// Listeners run outside the table lock, so they may add or remove
    /// listeners. A panicking listener is logged and skipped.
    pub fn dispatch(&self, event: RealtimeEvent) {
        let kind = event.kind();
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .get(&kind)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(kind = ?kind, "Event listener panicked");
            }
        }

        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Stream of every event dispatched from now on
    pub fn subscribe(&self) -> EventStream {
        BroadcastStream::new(self.sender.subscribe())
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}
