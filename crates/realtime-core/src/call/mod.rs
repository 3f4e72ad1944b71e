//! Voice calls over a SIP-like signaling transport
//!
//! - [`state`] - the state machine as a pure transition table
//! - [`sdp`] - negotiation payload filter and dial-string validation
//! - [`session`] - call ids, records and snapshots
//! - [`persistence`] - the durable "was connected" flag
//! - [`controller`] - the driver owning registration and the active call

pub mod controller;
pub mod persistence;
pub mod sdp;
pub mod session;
pub mod state;

pub use controller::{CallController, CallHooks, CleanupHook, MediaSink};
pub use persistence::{FileFlagStore, MemoryFlagStore, SessionFlagStore};
pub use sdp::{filter_negotiation_payload, validate_number};
pub use session::{CallId, CallRecord, CallSnapshot};
pub use state::{next_state, CallState, CallTrigger};
