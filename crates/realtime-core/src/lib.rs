//! # Confab realtime core
//!
//! Client-side session core for a chat application with voice calling.
//! It keeps one reconnecting publish/subscribe session per conversation,
//! deduplicates and orders what arrives on it, and runs a call state
//! machine on top of a SIP-like signaling link.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 SessionOrchestrator                  │
//! │   open_channel / send_to / make_call / answer / ...  │
//! ├───────────────────────────┬──────────────────────────┤
//! │      ChannelRegistry      │      CallController      │
//! │  key -> MessageSession    │  registration + 1 call   │
//! ├───────────────────────────┼──────────────────────────┤
//! │      PubSubTransport      │    SignalingTransport    │
//! └───────────────────────────┴──────────────────────────┘
//! ```
//!
//! Every session is driven by a single task that owns its state; handles
//! only enqueue commands. Events flow up through the [`events`] dispatcher
//! to listeners registered on the orchestrator.
//!
//! ## Quick start
//!
//! ```rust
//! use confab_realtime_core::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = MemoryBroker::new();
//! let orchestrator = SessionOrchestrator::builder(RealtimeConfig::default())
//!     .with_transport_factory(Arc::new(broker.clone()))
//!     .build()?;
//!
//! let key = ChannelKey::from("group-1");
//! let channel = orchestrator.open_channel(key.clone())?;
//! let mut state = channel.state_watch();
//! state.wait_for(|s| *s == ConnectionState::Connected).await?;
//!
//! orchestrator
//!     .send_to(&key, OutboundMessage::new("alice", "Chat chung", "hello"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod message;
pub mod orchestrator;
pub mod registry;
pub mod transport;

pub use call::{CallController, CallId, CallRecord, CallSnapshot, CallState};
pub use config::{CallConfig, ChannelConfig, RealtimeConfig};
pub use error::{RealtimeError, RealtimeResult};
pub use events::{EventDispatcher, EventKind, ListenerId, RealtimeEvent};
pub use message::{ChannelKey, ConnectionState, InboundMessage, MessageSession, OutboundMessage};
pub use orchestrator::{ChannelHandle, SessionOrchestrator, SessionOrchestratorBuilder};
pub use registry::ChannelRegistry;

/// Commonly used items
pub mod prelude {
    pub use crate::call::{CallId, CallRecord, CallSnapshot, CallState, MediaSink};
    pub use crate::config::{CallConfig, ChannelConfig, RealtimeConfig};
    pub use crate::error::{RealtimeError, RealtimeResult};
    pub use crate::events::{
        CallStatusInfo, ConnectionSource, ConnectionStatus, ConnectionStatusInfo,
        IncomingCallInfo, RealtimeEvent,
    };
    pub use crate::message::{
        Attachment, ChannelKey, ConnectionState, InboundMessage, MessageSession, MessageStatus,
        OutboundMessage,
    };
    pub use crate::orchestrator::{ChannelHandle, SessionOrchestrator};
    pub use crate::transport::memory::{MemoryBroker, MemorySignaling};
}
