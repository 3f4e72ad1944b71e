//! One call instance and what is reported about it

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::state::CallState;
use crate::transport::{CallDirection, NegotiationSession};

/// Identifier of one call instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(Uuid);

impl CallId {
    /// Fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Summary of a finished call, handed to the cleanup hook once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Call instance
    pub call_id: CallId,
    /// Who initiated the call
    pub direction: CallDirection,
    /// Remote party
    pub remote_identity: String,
    /// When the session was adopted
    pub created_at: DateTime<Utc>,
    /// When the call connected, if it did
    pub answered_at: Option<DateTime<Utc>>,
    /// When the call reached its terminal state
    pub ended_at: DateTime<Utc>,
    /// `Ended` or `Failed`
    pub final_state: CallState,
    /// Whole seconds spent connected
    pub duration_secs: u64,
    /// Why the call ended
    pub end_reason: Option<String>,
}

/// Read-only view of the controller for synchronous queries
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    /// State of the active call, or of the registration when no call is active
    pub state: CallState,
    /// Registration state of the line
    pub registration: CallState,
    /// Active or most recent call
    pub call_id: Option<CallId>,
    /// Direction of that call
    pub direction: Option<CallDirection>,
    /// Remote party of that call
    pub remote_identity: Option<String>,
    /// Wall-clock time the call connected
    pub started_at: Option<DateTime<Utc>>,
    /// Monotonic instant the call connected
    pub connected_at: Option<Instant>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            registration: CallState::Idle,
            call_id: None,
            direction: None,
            remote_identity: None,
            started_at: None,
            connected_at: None,
        }
    }
}

/// Mutable bookkeeping for one call, owned by the controller driver
pub(crate) struct CallSession {
    pub id: CallId,
    pub direction: CallDirection,
    pub remote_identity: String,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub connected_at: Option<Instant>,
    pub handle: Arc<dyn NegotiationSession>,
    pub media_attached: bool,
    pub terminal_emitted: bool,
    pub ticker: Option<JoinHandle<()>>,
}

impl CallSession {
    pub fn adopt(handle: Arc<dyn NegotiationSession>, state: CallState) -> Self {
        Self {
            id: CallId::new(),
            direction: handle.direction(),
            remote_identity: handle.remote_identity(),
            state,
            created_at: Utc::now(),
            started_at: None,
            connected_at: None,
            handle,
            media_attached: false,
            terminal_emitted: false,
            ticker: None,
        }
    }

    /// Negotiation session id used to route transport events
    pub fn session_id(&self) -> &str {
        self.handle.id()
    }

    /// Mark the call connected; the clock starts here, not at creation
    pub fn mark_connected(&mut self) {
        self.state = CallState::Connected;
        self.started_at = Some(Utc::now());
        self.connected_at = Some(Instant::now());
    }

    /// Whole seconds since the call connected
    pub fn elapsed_secs(&self) -> u64 {
        self.connected_at
            .map(|at| at.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }

    pub fn record(&self, ended_at: DateTime<Utc>, reason: Option<String>) -> CallRecord {
        CallRecord {
            call_id: self.id,
            direction: self.direction,
            remote_identity: self.remote_identity.clone(),
            created_at: self.created_at,
            answered_at: self.started_at,
            ended_at,
            final_state: self.state,
            duration_secs: self.elapsed_secs(),
            end_reason: reason,
        }
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}
