//! Call state machine as a pure transition table
//!
//! The controller never assigns a state directly; it feeds a
//! [`CallTrigger`] through [`next_state`] and ignores triggers that have no
//! entry for the current state. Registration and the per-call lifecycle
//! share the same table: registration moves through `Idle`, `Registering`,
//! `Ready` and `Failed`, a call instance through the ringing states,
//! `Connected` and its terminal state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of the signaling line or of one call instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Not registered
    Idle,
    /// Registration sent, waiting for the registrar
    Registering,
    /// Registered and able to place or receive calls
    Ready,
    /// We are calling the remote party
    OutgoingRinging,
    /// The remote party is calling us
    IncomingRinging,
    /// Media is flowing
    Connected,
    /// The call finished normally
    Ended,
    /// Registration or the call failed
    Failed,
}

impl CallState {
    /// Not in `Idle`, `Ended` or `Failed`
    pub fn is_live(&self) -> bool {
        !matches!(self, CallState::Idle | CallState::Ended | CallState::Failed)
    }

    /// `Ended` or `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// Ringing in either direction or connected
    pub fn is_in_call(&self) -> bool {
        matches!(
            self,
            CallState::OutgoingRinging | CallState::IncomingRinging | CallState::Connected
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Registering => "registering",
            CallState::Ready => "ready",
            CallState::OutgoingRinging => "outgoing-ringing",
            CallState::IncomingRinging => "incoming-ringing",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Input to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallTrigger {
    /// Registration requested
    Register,
    /// The registrar accepted us
    Registered,
    /// The registrar refused us
    RegistrationFailed,
    /// The registration was removed
    Unregistered,
    /// The user dialed a number
    MakeCall,
    /// An inbound session arrived
    IncomingSession,
    /// The user answered
    Answer,
    /// The user rejected
    Reject,
    /// The remote party accepted our call
    PeerAccepted,
    /// The remote party ended the call
    PeerEnded,
    /// The call failed at the signaling level
    PeerFailed,
    /// The user hung up
    Hangup,
    /// A newer session replaced this call
    Superseded,
    /// The signaling socket dropped
    TransportDisconnected,
    /// The user stopped signaling
    Stop,
}

/// Look up the state reached from `state` on `trigger`
///
/// `None` means the trigger does not apply and must be ignored.
pub fn next_state(state: CallState, trigger: CallTrigger) -> Option<CallState> {
    use CallState::*;
    use CallTrigger::*;

    let next = match (state, trigger) {
        // Registration
        (Idle | Failed, Register) => Registering,
        (Registering, Registered) => Ready,
        (Registering | Ready, RegistrationFailed) => Failed,
        (Registering | Ready, Unregistered) => Idle,
        (Idle | Registering | Ready | Failed, Stop) => Idle,

        // Call setup
        (Ready, MakeCall) => OutgoingRinging,
        (Ready, IncomingSession) => IncomingRinging,
        (IncomingRinging, Answer) => Connected,
        (IncomingRinging, Reject) => Ended,
        (OutgoingRinging, PeerAccepted) => Connected,

        // Call teardown
        (OutgoingRinging | IncomingRinging | Connected, PeerEnded) => Ended,
        (OutgoingRinging | IncomingRinging | Connected, PeerFailed) => Failed,
        (OutgoingRinging | IncomingRinging | Connected, Hangup) => Ended,
        (OutgoingRinging | IncomingRinging | Connected, Superseded) => Ended,
        (OutgoingRinging | IncomingRinging | Connected, Stop) => Ended,

        // Transport loss: an active call is force-ended, the line fails
        (OutgoingRinging | IncomingRinging | Connected, TransportDisconnected) => Ended,
        (Idle | Registering | Ready | Failed, TransportDisconnected) => Failed,

        _ => return None,
    };
    Some(next)
}
