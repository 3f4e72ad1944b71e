//! Transport contracts consumed by the sessions
//!
//! The realtime core never speaks a wire protocol itself. It drives two
//! narrow adapters:
//!
//! - [`PubSubTransport`] - a websocket-backed publish/subscribe connection
//!   (STOMP in production) used by message sessions
//! - [`SignalingTransport`](signaling::SignalingTransport) - a SIP-like
//!   signaling socket used by the call controller
//!
//! Both report asynchronous happenings through an unbounded sender handed
//! to them when the connection is started, so that every event lands in the
//! owning session's single queue in the order the transport produced it.
//!
//! The [`memory`] module provides loopback implementations of both
//! contracts for tests and demonstrations.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::RealtimeResult;
use crate::message::ChannelKey;

pub mod memory;
pub mod signaling;

pub use signaling::{
    CallDirection, CallOptions, MediaHandle, NegotiationEvent, NegotiationSession, PayloadFilter,
    SignalingEvent, SignalingTransport,
};

/// Identifier of one active subscription on a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle(pub u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Something that happened on a publish/subscribe connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established and subscriptions may be made
    Connected,
    /// The connection closed
    Disconnected {
        /// Why the connection closed, as reported by the transport
        reason: String,
    },
    /// The broker reported an error; the connection is unusable
    ///
    /// The socket and its subscriptions may still be open.
    Error {
        /// Error detail reported by the broker
        detail: String,
    },
    /// A raw frame arrived on a subscription
    Frame {
        /// Subscription the frame arrived on
        subscription: SubscriptionHandle,
        /// Topic of that subscription
        topic: String,
        /// Undecoded frame body
        body: String,
    },
}

/// Sender half on which a transport reports its events
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Publish/subscribe connection used by a message session
///
/// Implementations must be cheap to call from a single task and must not
/// block; every method is awaited inside the owning session's driver.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Start connecting; success is reported later as
    /// [`TransportEvent::Connected`] on `events`
    async fn connect(&self, events: TransportEventSender) -> RealtimeResult<()>;

    /// Close the connection and drop all of its subscriptions
    async fn disconnect(&self) -> RealtimeResult<()>;

    /// Whether the connection is currently established
    fn is_connected(&self) -> bool;

    /// Subscribe to a topic; frames arrive as [`TransportEvent::Frame`]
    async fn subscribe(&self, topic: &str) -> RealtimeResult<SubscriptionHandle>;

    /// Cancel a subscription
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> RealtimeResult<()>;

    /// Publish a serialized body to a destination
    async fn publish(&self, destination: &str, body: String) -> RealtimeResult<()>;
}

/// Creates the transport backing a channel
///
/// The registry asks for one transport per channel key, mirroring one
/// broker connection per conversation.
pub trait TransportFactory: Send + Sync {
    /// Create a fresh, unconnected transport for `key`
    fn create(&self, key: &ChannelKey) -> Arc<dyn PubSubTransport>;
}
