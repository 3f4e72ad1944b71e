//! Signaling transport contract for voice calls
//!
//! Models the small part of a SIP user agent the call controller relies
//! on: starting the socket, registering, placing calls, and the per-call
//! negotiation object that represents one call on the wire.
//!
//! # Negotiation payload filtering
//!
//! The controller installs a [`PayloadFilter`] on every negotiation session
//! it adopts. Implementations must pass each locally generated session
//! description through the filter before sending it, regardless of call
//! direction.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::RealtimeResult;

/// Direction of a call relative to this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallDirection {
    /// The remote party called us
    Incoming,
    /// We called the remote party
    Outgoing,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallDirection::Incoming => write!(f, "incoming"),
            CallDirection::Outgoing => write!(f, "outgoing"),
        }
    }
}

/// Options passed when placing or answering a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOptions {
    /// ICE servers for media negotiation
    pub ice_servers: Vec<String>,
    /// Request an audio stream
    pub audio: bool,
    /// Request a video stream
    pub video: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            audio: true,
            video: false,
        }
    }
}

/// Opaque reference to the remote media of an established peer connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaHandle {
    /// Identifier of the remote stream
    pub stream_id: String,
}

/// Pure rewrite applied to locally generated session descriptions
pub type PayloadFilter = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Event raised by one negotiation session
#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    /// The remote party accepted our call
    Accepted,
    /// The call ended normally
    Ended {
        /// Cause reported by the peer or the transport
        cause: String,
    },
    /// The call failed
    Failed {
        /// Failure detail reported by the transport
        detail: String,
    },
    /// Media flows; the handle refers to the remote stream
    PeerConnectionEstablished(MediaHandle),
}

/// Something that happened on the signaling transport
#[derive(Clone)]
pub enum SignalingEvent {
    /// The signaling socket is up
    Connected,
    /// The signaling socket went down
    Disconnected {
        /// Reason reported by the transport
        reason: String,
    },
    /// Registration with the registrar succeeded
    Registered,
    /// The registration was removed
    Unregistered,
    /// Registration was refused or timed out
    RegistrationFailed {
        /// Failure detail reported by the registrar
        detail: String,
    },
    /// A negotiation session appeared that was not created by
    /// [`SignalingTransport::call`], typically an inbound call
    NewSession(Arc<dyn NegotiationSession>),
    /// Event for an existing negotiation session
    Session {
        /// Identifier of the session the event belongs to
        session_id: String,
        /// The event itself
        event: NegotiationEvent,
    },
}

impl fmt::Debug for SignalingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingEvent::Connected => write!(f, "Connected"),
            SignalingEvent::Disconnected { reason } => {
                f.debug_struct("Disconnected").field("reason", reason).finish()
            }
            SignalingEvent::Registered => write!(f, "Registered"),
            SignalingEvent::Unregistered => write!(f, "Unregistered"),
            SignalingEvent::RegistrationFailed { detail } => f
                .debug_struct("RegistrationFailed")
                .field("detail", detail)
                .finish(),
            SignalingEvent::NewSession(session) => f
                .debug_struct("NewSession")
                .field("id", &session.id())
                .field("direction", &session.direction())
                .finish(),
            SignalingEvent::Session { session_id, event } => f
                .debug_struct("Session")
                .field("session_id", session_id)
                .field("event", event)
                .finish(),
        }
    }
}

/// Sender half on which a signaling transport reports its events
pub type SignalingEventSender = mpsc::UnboundedSender<SignalingEvent>;

/// One call's negotiation object on the signaling transport
///
/// Owned exclusively by the call instance that adopted it. A superseded
/// session is always terminated before it is dropped.
#[async_trait]
pub trait NegotiationSession: Send + Sync {
    /// Stable identifier used to route [`SignalingEvent::Session`] events
    fn id(&self) -> &str;

    /// Who initiated the call
    fn direction(&self) -> CallDirection;

    /// Identity (user part) of the remote party
    fn remote_identity(&self) -> String;

    /// Install the filter applied to locally generated descriptions
    fn set_payload_filter(&self, filter: PayloadFilter);

    /// Accept an inbound call
    async fn answer(&self, options: &CallOptions) -> RealtimeResult<()>;

    /// End the call in whatever phase it is in
    async fn terminate(&self) -> RealtimeResult<()>;
}

/// SIP-like signaling connection used by the call controller
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open the signaling socket; events are reported on `events`
    async fn start(&self, events: SignalingEventSender) -> RealtimeResult<()>;

    /// Send a registration to the registrar
    async fn register(&self) -> RealtimeResult<()>;

    /// Place a call and return its negotiation session
    async fn call(
        &self,
        target: &str,
        options: &CallOptions,
    ) -> RealtimeResult<Arc<dyn NegotiationSession>>;

    /// Terminate every session and close the socket
    async fn stop(&self) -> RealtimeResult<()>;
}
