//! Chat messaging over a publish/subscribe broker
//!
//! - [`types`] - channel keys, inbound/outbound messages and their wire form
//! - [`timeline`] - dedup and ordering of received messages
//! - [`session`] - the reconnecting per-channel session

pub mod session;
pub mod timeline;
pub mod types;

pub use session::{ConnectionState, MessageCallback, MessageSession, StatusListener, StatusUpdate};
pub use timeline::{ApplyOutcome, Conversation, ConversationSnapshot};
pub use types::{Attachment, ChannelKey, InboundMessage, MessageId, MessageStatus, OutboundMessage};
