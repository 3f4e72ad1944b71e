//! Error types for the realtime session core
//!
//! Every fallible operation in this crate returns [`RealtimeResult`]. The
//! variants follow the layers of the crate: transport failures, payload
//! validation, caller-visible command rejections, and signaling failures
//! during an active call.
//!
//! # Propagation
//!
//! Only command rejections (`NotConnected`, `InvalidNumber`, `InvalidState`)
//! and startup problems (`Configuration`) are ever returned to the caller of
//! the orchestrator. Transport and negotiation failures are turned into
//! events by the sessions, and teardown errors are logged where they happen.
//!
//! ```rust
//! use confab_realtime_core::error::RealtimeError;
//!
//! let err = RealtimeError::not_connected("send");
//! assert!(!err.is_recoverable());
//! assert_eq!(err.category(), "state");
//!
//! let err = RealtimeError::transport("socket closed");
//! assert!(err.is_recoverable());
//! ```

use thiserror::Error;

/// Result type for realtime session operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Errors that can occur in the realtime session core
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RealtimeError {
    /// Connecting, publishing or signaling over the transport failed
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// An inbound frame could not be turned into a message
    #[error("Malformed payload: {reason}")]
    MalformedPayload { reason: String },

    /// The operation needs an established connection or registration
    #[error("Not connected: {operation} requires an established connection")]
    NotConnected { operation: String },

    /// A dialed number did not pass validation
    #[error("Invalid number: {number:?}")]
    InvalidNumber { number: String },

    /// Signaling failed while a call was being set up or was active
    #[error("Negotiation failure: {reason}")]
    NegotiationFailure { reason: String },

    /// The command is not valid in the current call state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The registration flag store could not be read or written
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// The session's driver task is gone
    #[error("Session closed: {name}")]
    SessionClosed { name: String },
}

impl RealtimeError {
    /// Create a transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Create a malformed payload error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            reason: reason.into(),
        }
    }

    /// Create a not-connected error for the named operation
    pub fn not_connected(operation: impl Into<String>) -> Self {
        Self::NotConnected {
            operation: operation.into(),
        }
    }

    /// Create an invalid number error
    pub fn invalid_number(number: impl Into<String>) -> Self {
        Self::InvalidNumber {
            number: number.into(),
        }
    }

    /// Create a negotiation failure
    pub fn negotiation(reason: impl Into<String>) -> Self {
        Self::NegotiationFailure {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Create a session-closed error
    pub fn closed(name: impl Into<String>) -> Self {
        Self::SessionClosed { name: name.into() }
    }

    /// Whether retrying the same operation later may succeed
    ///
    /// Transport and negotiation failures depend on the network and the
    /// peer; everything else is a property of the request or of local state.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RealtimeError::Transport { .. } | RealtimeError::NegotiationFailure { .. }
        )
    }

    /// Short category name used as a structured logging field
    pub fn category(&self) -> &'static str {
        match self {
            RealtimeError::Transport { .. } => "transport",
            RealtimeError::MalformedPayload { .. } => "payload",
            RealtimeError::NotConnected { .. }
            | RealtimeError::InvalidState { .. }
            | RealtimeError::SessionClosed { .. } => "state",
            RealtimeError::InvalidNumber { .. } => "validation",
            RealtimeError::NegotiationFailure { .. } => "signaling",
            RealtimeError::Configuration { .. } => "configuration",
            RealtimeError::Persistence { .. } => "persistence",
        }
    }
}

impl From<serde_json::Error> for RealtimeError {
    fn from(err: serde_json::Error) -> Self {
        RealtimeError::malformed(err.to_string())
    }
}

impl From<config::ConfigError> for RealtimeError {
    fn from(err: config::ConfigError) -> Self {
        RealtimeError::config(err.to_string())
    }
}
