//! Call controller: registration and the active call on one signaling link
//!
//! Like message sessions, the controller is a handle over a command queue
//! drained by one driver task. The driver owns the signaling transport,
//! the registration state and at most one [`CallSession`]; every
//! transition goes through [`next_state`].
//!
//! # Replacing a call
//!
//! When a new negotiation session arrives (inbound, or from
//! [`make_call`](CallController::make_call)) while another call is ringing
//! or connected, the driver terminates the old session, emits its terminal
//! event and runs its cleanup, and only then adopts the new one. Both
//! happen inside one step of the driver, so the two sessions never coexist.
//!
//! # Terminal events
//!
//! A call instance reports `Ended` or `Failed` exactly once and runs the
//! cleanup hook exactly once, however many end or failure signals arrive
//! for it afterwards.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::persistence::SessionFlagStore;
use super::sdp::{filter_negotiation_payload, validate_number};
use super::session::{CallId, CallRecord, CallSession, CallSnapshot};
use super::state::{next_state, CallState, CallTrigger};
use crate::config::CallConfig;
use crate::error::{RealtimeError, RealtimeResult};
use crate::events::{
    CallStatusInfo, ConnectionSource, ConnectionStatus, ConnectionStatusInfo, EventDispatcher,
    IncomingCallInfo, RealtimeEvent,
};
use crate::transport::{
    CallDirection, CallOptions, MediaHandle, NegotiationEvent, NegotiationSession, PayloadFilter,
    SignalingEvent, SignalingTransport,
};

/// Receives the remote media of a connected call
///
/// There is one sink per controller; it holds at most one call's media.
pub trait MediaSink: Send + Sync {
    /// Media for `call_id` is available
    fn attach(&self, call_id: &CallId, media: &MediaHandle);

    /// The call ended; drop anything held for it
    fn release(&self, call_id: &CallId);
}

/// Runs once per call instance when it reaches a terminal state
pub type CleanupHook = Arc<dyn Fn(&CallRecord) + Send + Sync>;

/// Optional collaborators of the controller
#[derive(Default, Clone)]
pub struct CallHooks {
    /// Where remote media goes
    pub media: Option<Arc<dyn MediaSink>>,
    /// Called with the record of every finished call
    pub cleanup: Option<CleanupHook>,
}

enum ControllerCommand {
    Start {
        reply: Option<oneshot::Sender<RealtimeResult<()>>>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
    MakeCall {
        number: String,
        reply: oneshot::Sender<RealtimeResult<CallId>>,
    },
    Answer {
        reply: oneshot::Sender<RealtimeResult<()>>,
    },
    Reject {
        reply: oneshot::Sender<RealtimeResult<()>>,
    },
    Hangup {
        done: oneshot::Sender<()>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

enum Timer {
    Reconnect(u64),
    Tick(CallId),
}

struct ControllerHandle {
    commands: mpsc::UnboundedSender<ControllerCommand>,
    snapshot: watch::Receiver<CallSnapshot>,
    duration: watch::Receiver<Option<u64>>,
    number_range: (usize, usize),
}

/// Handle to the call controller
#[derive(Clone)]
pub struct CallController {
    inner: Arc<ControllerHandle>,
}

impl CallController {
    /// Spawn the controller driver
    ///
    /// When `config.auto_resume` is set and `store` reports that signaling
    /// was connected last time, registration starts immediately.
    pub fn spawn(
        transport: Arc<dyn SignalingTransport>,
        config: CallConfig,
        store: Arc<dyn SessionFlagStore>,
        dispatcher: Arc<EventDispatcher>,
        hooks: CallHooks,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(CallSnapshot::default());
        let (duration_tx, duration) = watch::channel(None);
        let number_range = (config.number_min_digits, config.number_max_digits);

        let driver = ControllerDriver {
            transport,
            config,
            store,
            dispatcher,
            hooks,
            registration: CallState::Idle,
            call: None,
            signaling_tx,
            timer_tx,
            snapshot_tx,
            duration_tx,
            reconnect_generation: 0,
            reconnect_task: None,
            manual_stop: false,
        };
        tokio::spawn(driver.run(command_rx, signaling_rx, timer_rx));

        Self {
            inner: Arc::new(ControllerHandle {
                commands,
                snapshot,
                duration,
                number_range,
            }),
        }
    }

    /// Start the signaling link and register
    pub async fn start(&self) -> RealtimeResult<()> {
        let (reply, wait) = oneshot::channel();
        self.enqueue(ControllerCommand::Start { reply: Some(reply) })?;
        wait.await.map_err(|_| closed())?
    }

    /// Terminate any call, close the link and clear the persisted flag
    pub async fn stop(&self) -> RealtimeResult<()> {
        let (done, wait) = oneshot::channel();
        self.enqueue(ControllerCommand::Stop { done })?;
        wait.await.map_err(|_| closed())
    }

    /// Dial `number`
    ///
    /// The number is validated before anything else happens; an invalid one
    /// fails with [`RealtimeError::InvalidNumber`] and leaves no trace.
    pub async fn make_call(&self, number: &str) -> RealtimeResult<CallId> {
        let (min, max) = self.inner.number_range;
        validate_number(number, min, max)?;

        let (reply, wait) = oneshot::channel();
        self.enqueue(ControllerCommand::MakeCall {
            number: number.to_string(),
            reply,
        })?;
        wait.await.map_err(|_| closed())?
    }

    /// Answer the ringing inbound call
    pub async fn answer(&self) -> RealtimeResult<()> {
        let (reply, wait) = oneshot::channel();
        self.enqueue(ControllerCommand::Answer { reply })?;
        wait.await.map_err(|_| closed())?
    }

    /// Reject the ringing inbound call
    pub async fn reject(&self) -> RealtimeResult<()> {
        let (reply, wait) = oneshot::channel();
        self.enqueue(ControllerCommand::Reject { reply })?;
        wait.await.map_err(|_| closed())?
    }

    /// End the active call; a no-op when there is none
    pub async fn hangup(&self) -> RealtimeResult<()> {
        let (done, wait) = oneshot::channel();
        self.enqueue(ControllerCommand::Hangup { done })?;
        wait.await.map_err(|_| closed())
    }

    /// Stop signaling and the driver
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        if self.enqueue(ControllerCommand::Shutdown { done }).is_ok() {
            let _ = wait.await;
        }
    }

    /// Current state of the line and the active call
    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Watch snapshot changes
    pub fn snapshot_watch(&self) -> watch::Receiver<CallSnapshot> {
        self.inner.snapshot.clone()
    }

    /// Time since the active call connected; `None` unless connected
    pub fn duration(&self) -> Option<Duration> {
        let snapshot = self.inner.snapshot.borrow();
        match (snapshot.state, snapshot.connected_at) {
            (CallState::Connected, Some(at)) => Some(at.elapsed()),
            _ => None,
        }
    }

    /// Whole seconds connected, updated once a second
    pub fn duration_watch(&self) -> watch::Receiver<Option<u64>> {
        self.inner.duration.clone()
    }

    fn enqueue(&self, command: ControllerCommand) -> RealtimeResult<()> {
        self.inner.commands.send(command).map_err(|_| closed())
    }
}

fn closed() -> RealtimeError {
    RealtimeError::closed("call controller")
}

struct ControllerDriver {
    transport: Arc<dyn SignalingTransport>,
    config: CallConfig,
    store: Arc<dyn SessionFlagStore>,
    dispatcher: Arc<EventDispatcher>,
    hooks: CallHooks,
    registration: CallState,
    call: Option<CallSession>,
    signaling_tx: mpsc::UnboundedSender<SignalingEvent>,
    timer_tx: mpsc::UnboundedSender<Timer>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    duration_tx: watch::Sender<Option<u64>>,
    reconnect_generation: u64,
    reconnect_task: Option<JoinHandle<()>>,
    manual_stop: bool,
}

impl ControllerDriver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ControllerCommand>,
        mut signaling: mpsc::UnboundedReceiver<SignalingEvent>,
        mut timers: mpsc::UnboundedReceiver<Timer>,
    ) {
        self.resume().await;

        loop {
            tokio::select! {
                biased;

                Some(event) = signaling.recv() => self.on_signaling_event(event).await,

                Some(timer) = timers.recv() => self.on_timer(timer).await,

                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.stop().await;
                        break;
                    }
                },
            }
        }
        debug!("Call controller driver stopped");
    }

    async fn resume(&mut self) {
        if !self.config.auto_resume {
            return;
        }
        match self.store.load().await {
            Ok(true) => {
                info!("Signaling was connected before restart; resuming registration");
                let _ = self.start().await;
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Could not read the registration flag"),
        }
    }

    /// Returns false once the controller is shut down
    async fn on_command(&mut self, command: ControllerCommand) -> bool {
        match command {
            ControllerCommand::Start { reply } => {
                self.manual_stop = false;
                let result = self.start().await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            ControllerCommand::Stop { done } => {
                self.stop().await;
                let _ = done.send(());
            }
            ControllerCommand::MakeCall { number, reply } => {
                let _ = reply.send(self.make_call(&number).await);
            }
            ControllerCommand::Answer { reply } => {
                let _ = reply.send(self.answer().await);
            }
            ControllerCommand::Reject { reply } => {
                let _ = reply.send(self.reject().await);
            }
            ControllerCommand::Hangup { done } => {
                self.end_active_call(CallTrigger::Hangup, "hangup").await;
                let _ = done.send(());
            }
            ControllerCommand::Shutdown { done } => {
                self.stop().await;
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    // ===== REGISTRATION =====

    async fn start(&mut self) -> RealtimeResult<()> {
        if matches!(self.registration, CallState::Registering | CallState::Ready) {
            debug!(state = %self.registration, "Signaling already started");
            return Ok(());
        }
        self.cancel_reconnect();

        info!("Starting signaling");
        if let Err(e) = self.transport.start(self.signaling_tx.clone()).await {
            warn!(error = %e, category = e.category(), "Signaling start failed");
            self.emit_status(ConnectionStatus::Error, Some(e.to_string()));
            self.set_registration(CallTrigger::TransportDisconnected, Some(e.to_string()));
            self.schedule_reconnect();
            return Err(e);
        }
        self.persist(true).await;

        self.set_registration(CallTrigger::Register, None);
        if let Err(e) = self.transport.register().await {
            warn!(error = %e, "Register request failed");
            self.set_registration(CallTrigger::RegistrationFailed, Some(e.to_string()));
            return Err(e);
        }
        Ok(())
    }

    async fn stop(&mut self) {
        self.manual_stop = true;
        self.cancel_reconnect();
        self.end_active_call(CallTrigger::Stop, "signaling stopped").await;
        if let Err(e) = self.transport.stop().await {
            warn!(error = %e, "Signaling stop failed; treating as stopped");
        }
        self.persist(false).await;
        if self.registration != CallState::Idle {
            self.emit_status(ConnectionStatus::Disconnected, None);
            self.set_registration(CallTrigger::Stop, None);
        }
    }

    async fn on_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => {
                self.persist(true).await;
                self.emit_status(ConnectionStatus::Connected, None);
            }
            SignalingEvent::Disconnected { reason } => self.on_disconnected(reason).await,
            SignalingEvent::Registered => {
                if self.set_registration(CallTrigger::Registered, None) {
                    info!("Signaling registered");
                    self.emit_status(ConnectionStatus::Registered, None);
                }
            }
            SignalingEvent::Unregistered => {
                self.set_registration(CallTrigger::Unregistered, None);
                self.emit_status(ConnectionStatus::Unregistered, None);
            }
            SignalingEvent::RegistrationFailed { detail } => {
                warn!(detail = %detail, "Registration failed");
                self.set_registration(CallTrigger::RegistrationFailed, Some(detail.clone()));
                self.emit_status(ConnectionStatus::RegistrationFailed, Some(detail));
            }
            SignalingEvent::NewSession(session) => self.adopt(session).await,
            SignalingEvent::Session { session_id, event } => {
                self.on_session_event(&session_id, event).await;
            }
        }
    }

    async fn on_disconnected(&mut self, reason: String) {
        if self.manual_stop {
            debug!(reason = %reason, "Disconnect after manual stop ignored");
            return;
        }
        warn!(reason = %reason, "Signaling link lost");
        self.persist(false).await;
        self.emit_status(ConnectionStatus::Disconnected, Some(reason.clone()));

        // Nothing can be terminated on a dead link; just finish the call.
        if self.call.as_ref().is_some_and(|c| c.state.is_in_call()) {
            self.finish_call(CallTrigger::TransportDisconnected, Some(reason.clone()));
        }
        self.set_registration(CallTrigger::TransportDisconnected, Some(reason));
        self.schedule_reconnect();
    }

    fn set_registration(&mut self, trigger: CallTrigger, reason: Option<String>) -> bool {
        let previous = self.registration;
        let Some(next) = next_state(previous, trigger) else {
            debug!(state = %previous, trigger = ?trigger, "Registration trigger ignored");
            return false;
        };
        if next == previous {
            return false;
        }
        self.registration = next;
        debug!(from = %previous, to = %next, "Registration state changed");
        self.dispatcher
            .dispatch(RealtimeEvent::CallStateChanged(CallStatusInfo {
                call_id: None,
                new_state: next,
                previous_state: Some(previous),
                remote_identity: None,
                reason,
                timestamp: Utc::now(),
            }));
        self.publish_snapshot();
        true
    }

    async fn persist(&self, connected: bool) {
        if let Err(e) = self.store.store(connected).await {
            warn!(error = %e, connected, "Could not persist the registration flag");
        }
    }

    // ===== CALLS =====

    async fn make_call(&mut self, number: &str) -> RealtimeResult<CallId> {
        if next_state(self.registration, CallTrigger::MakeCall).is_none() {
            return Err(RealtimeError::not_connected("make_call"));
        }

        let target = self.config.dial_target(number);
        info!(target = %target, "Placing call");
        let session = self
            .transport
            .call(&target, &self.call_options())
            .await
            .map_err(|e| match e {
                RealtimeError::NegotiationFailure { .. } => e,
                other => RealtimeError::negotiation(other.to_string()),
            })?;

        self.adopt(session).await;
        self.call
            .as_ref()
            .map(|c| c.id)
            .ok_or_else(|| RealtimeError::invalid_state("placed call was not adopted"))
    }

    async fn answer(&mut self) -> RealtimeResult<()> {
        let Some(call) = self.call.as_ref().filter(|c| c.state == CallState::IncomingRinging)
        else {
            return Err(RealtimeError::invalid_state("no incoming call is ringing"));
        };

        let handle = Arc::clone(&call.handle);
        if let Err(e) = handle.answer(&self.call_options()).await {
            warn!(error = %e, "Answer failed");
            self.finish_call(CallTrigger::PeerFailed, Some(e.to_string()));
            return Err(e);
        }
        self.transition_call(CallTrigger::Answer);
        Ok(())
    }

    async fn reject(&mut self) -> RealtimeResult<()> {
        if !self
            .call
            .as_ref()
            .is_some_and(|c| c.state == CallState::IncomingRinging)
        {
            return Err(RealtimeError::invalid_state("no incoming call is ringing"));
        }
        self.end_active_call(CallTrigger::Reject, "rejected").await;
        Ok(())
    }

    /// Terminate the active call on the wire, then finish it locally
    async fn end_active_call(&mut self, trigger: CallTrigger, reason: &str) {
        let Some(call) = self.call.as_ref().filter(|c| c.state.is_in_call()) else {
            return;
        };
        let handle = Arc::clone(&call.handle);
        if let Err(e) = handle.terminate().await {
            warn!(error = %e, call_id = %call.id, "Terminate failed; ending call locally");
        }
        self.finish_call(trigger, Some(reason.to_string()));
    }

    async fn adopt(&mut self, session: Arc<dyn NegotiationSession>) {
        if let Some(current) = &self.call {
            if current.session_id() == session.id() {
                debug!(session_id = %session.id(), "Session already adopted");
                return;
            }
        }

        // The old call is terminated and finished before the new one exists.
        self.end_active_call(CallTrigger::Superseded, "superseded by a new session")
            .await;

        let filter: PayloadFilter = Arc::new(filter_negotiation_payload);
        session.set_payload_filter(filter);

        let state = match session.direction() {
            CallDirection::Incoming => CallState::IncomingRinging,
            CallDirection::Outgoing => CallState::OutgoingRinging,
        };
        let call = CallSession::adopt(session, state);
        info!(
            call_id = %call.id,
            direction = %call.direction,
            remote = %call.remote_identity,
            "Call session adopted"
        );

        self.dispatcher
            .dispatch(RealtimeEvent::CallStateChanged(CallStatusInfo {
                call_id: Some(call.id),
                new_state: state,
                previous_state: None,
                remote_identity: Some(call.remote_identity.clone()),
                reason: None,
                timestamp: call.created_at,
            }));
        if call.direction == CallDirection::Incoming {
            self.dispatcher
                .dispatch(RealtimeEvent::IncomingCall(IncomingCallInfo {
                    call_id: call.id,
                    remote_identity: call.remote_identity.clone(),
                    created_at: call.created_at,
                }));
        }

        self.call = Some(call);
        let _ = self.duration_tx.send_replace(None);
        self.publish_snapshot();
    }

    async fn on_session_event(&mut self, session_id: &str, event: NegotiationEvent) {
        let current = self
            .call
            .as_ref()
            .is_some_and(|c| c.session_id() == session_id);
        if !current {
            debug!(session_id = %session_id, event = ?event, "Event for a superseded session ignored");
            return;
        }

        match event {
            NegotiationEvent::Accepted => self.transition_call(CallTrigger::PeerAccepted),
            NegotiationEvent::Ended { cause } => {
                self.finish_call(CallTrigger::PeerEnded, Some(cause));
            }
            NegotiationEvent::Failed { detail } => {
                self.finish_call(CallTrigger::PeerFailed, Some(detail));
            }
            NegotiationEvent::PeerConnectionEstablished(media) => self.attach_media(&media),
        }
    }

    /// Apply a non-terminal trigger to the active call
    fn transition_call(&mut self, trigger: CallTrigger) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let previous = call.state;
        let Some(next) = next_state(previous, trigger) else {
            debug!(call_id = %call.id, state = %previous, trigger = ?trigger, "Call trigger ignored");
            return;
        };

        if next == CallState::Connected {
            call.mark_connected();
            call.ticker = Some(spawn_ticker(call.id, self.timer_tx.clone()));
            info!(call_id = %call.id, "Call connected");
        } else {
            call.state = next;
        }

        let info = CallStatusInfo {
            call_id: Some(call.id),
            new_state: next,
            previous_state: Some(previous),
            remote_identity: Some(call.remote_identity.clone()),
            reason: None,
            timestamp: Utc::now(),
        };
        self.dispatcher.dispatch(RealtimeEvent::CallStateChanged(info));
        if next == CallState::Connected {
            let _ = self.duration_tx.send_replace(Some(0));
        }
        self.publish_snapshot();
    }

    /// Move the active call to its terminal state, once
    fn finish_call(&mut self, trigger: CallTrigger, reason: Option<String>) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.terminal_emitted {
            debug!(call_id = %call.id, "Duplicate terminal signal suppressed");
            return;
        }
        let previous = call.state;
        let Some(next) = next_state(previous, trigger).filter(CallState::is_terminal) else {
            debug!(call_id = %call.id, state = %previous, trigger = ?trigger, "Terminal trigger ignored");
            return;
        };

        call.stop_ticker();
        call.state = next;
        call.terminal_emitted = true;
        let ended_at = Utc::now();
        let record = call.record(ended_at, reason.clone());
        let media_attached = std::mem::take(&mut call.media_attached);
        let call_id = call.id;
        let remote = call.remote_identity.clone();

        info!(call_id = %call_id, state = %next, reason = ?reason, "Call finished");
        self.dispatcher
            .dispatch(RealtimeEvent::CallStateChanged(CallStatusInfo {
                call_id: Some(call_id),
                new_state: next,
                previous_state: Some(previous),
                remote_identity: Some(remote),
                reason,
                timestamp: ended_at,
            }));

        if media_attached {
            if let Some(media) = &self.hooks.media {
                let media = Arc::clone(media);
                if catch_unwind(AssertUnwindSafe(|| media.release(&call_id))).is_err() {
                    warn!(call_id = %call_id, "Media sink panicked on release");
                }
            }
        }
        if let Some(cleanup) = &self.hooks.cleanup {
            let cleanup = Arc::clone(cleanup);
            if catch_unwind(AssertUnwindSafe(|| cleanup(&record))).is_err() {
                warn!(call_id = %call_id, "Call cleanup hook panicked");
            }
        }

        let _ = self.duration_tx.send_replace(None);
        self.publish_snapshot();
    }

    fn attach_media(&mut self, media: &MediaHandle) {
        let Some(call) = self.call.as_mut().filter(|c| c.state.is_in_call()) else {
            return;
        };
        debug!(call_id = %call.id, stream = %media.stream_id, "Remote media established");
        if let Some(sink) = &self.hooks.media {
            let sink = Arc::clone(sink);
            let call_id = call.id;
            if catch_unwind(AssertUnwindSafe(|| sink.attach(&call_id, media))).is_err() {
                warn!(call_id = %call_id, "Media sink panicked on attach");
                return;
            }
            call.media_attached = true;
        }
    }

    fn call_options(&self) -> CallOptions {
        CallOptions {
            ice_servers: self.config.ice_servers.clone(),
            audio: self.config.audio,
            video: self.config.video,
        }
    }

    // ===== TIMERS =====

    async fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Reconnect(generation) => {
                if generation != self.reconnect_generation || self.manual_stop {
                    debug!(generation, "Stale signaling reconnect discarded");
                    return;
                }
                self.reconnect_task = None;
                info!("Restarting signaling");
                let _ = self.start().await;
            }
            Timer::Tick(call_id) => {
                let Some(call) = self
                    .call
                    .as_ref()
                    .filter(|c| c.id == call_id && c.state == CallState::Connected)
                else {
                    return;
                };
                let _ = self.duration_tx.send_replace(Some(call.elapsed_secs()));
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.manual_stop {
            return;
        }
        let Some(delay) = self.config.reconnect_delay() else {
            return;
        };
        self.cancel_reconnect();
        let generation = self.reconnect_generation;
        let timers = self.timer_tx.clone();
        debug!(delay_ms = delay.as_millis() as u64, "Signaling restart scheduled");
        self.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(Timer::Reconnect(generation));
        }));
    }

    fn cancel_reconnect(&mut self) {
        self.reconnect_generation += 1;
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }

    // ===== REPORTING =====

    fn emit_status(&self, status: ConnectionStatus, detail: Option<String>) {
        self.dispatcher
            .dispatch(RealtimeEvent::ConnectionStatusChanged(ConnectionStatusInfo::now(
                ConnectionSource::Signaling,
                status,
                detail,
            )));
    }

    fn publish_snapshot(&self) {
        let active = self.call.as_ref().filter(|c| c.state.is_in_call());
        let last = self.call.as_ref();
        let snapshot = CallSnapshot {
            state: active.map(|c| c.state).unwrap_or(self.registration),
            registration: self.registration,
            call_id: last.map(|c| c.id),
            direction: last.map(|c| c.direction),
            remote_identity: last.map(|c| c.remote_identity.clone()),
            started_at: active.and_then(|c| c.started_at),
            connected_at: active.and_then(|c| c.connected_at),
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}

fn spawn_ticker(call_id: CallId, timers: mpsc::UnboundedSender<Timer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            if timers.send(Timer::Tick(call_id)).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::persistence::MemoryFlagStore;
    use crate::transport::memory::MemorySignaling;

    fn controller(signaling: &MemorySignaling) -> (CallController, Arc<EventDispatcher>) {
        let dispatcher = Arc::new(EventDispatcher::new(64));
        let controller = CallController::spawn(
            Arc::new(signaling.clone()),
            CallConfig::default().with_sip_domain("pbx.example.com"),
            Arc::new(MemoryFlagStore::default()),
            dispatcher.clone(),
            CallHooks::default(),
        );
        (controller, dispatcher)
    }

    async fn wait_state(controller: &CallController, want: CallState) {
        let mut watch = controller.snapshot_watch();
        tokio::time::timeout(Duration::from_secs(5), watch.wait_for(|s| s.state == want))
            .await
            .expect("state not reached")
            .expect("controller dropped");
    }

    #[tokio::test]
    async fn test_start_registers() {
        let signaling = MemorySignaling::new();
        let (controller, _) = controller(&signaling);

        controller.start().await.unwrap();
        wait_state(&controller, CallState::Ready).await;
        assert_eq!(signaling.start_count(), 1);
        assert_eq!(signaling.register_count(), 1);

        // Starting again while ready does nothing.
        controller.start().await.unwrap();
        assert_eq!(signaling.start_count(), 1);
    }

    #[tokio::test]
    async fn test_make_call_requires_registration() {
        let signaling = MemorySignaling::new();
        let (controller, _) = controller(&signaling);

        let err = controller.make_call("0912345678").await.unwrap_err();
        assert!(matches!(err, RealtimeError::NotConnected { .. }));
        assert!(signaling.placed_calls().is_empty());
    }

    #[tokio::test]
    async fn test_answer_without_ringing_is_invalid_state() {
        let signaling = MemorySignaling::new();
        let (controller, _) = controller(&signaling);
        controller.start().await.unwrap();
        wait_state(&controller, CallState::Ready).await;

        assert!(matches!(
            controller.answer().await,
            Err(RealtimeError::InvalidState { .. })
        ));
        assert!(matches!(
            controller.reject().await,
            Err(RealtimeError::InvalidState { .. })
        ));
        controller.hangup().await.unwrap();
        assert_eq!(controller.snapshot().state, CallState::Ready);
    }

    #[tokio::test]
    async fn test_dial_target_uses_domain() {
        let signaling = MemorySignaling::new();
        let (controller, _) = controller(&signaling);
        controller.start().await.unwrap();
        wait_state(&controller, CallState::Ready).await;

        controller.make_call("0912345678").await.unwrap();
        assert_eq!(signaling.placed_calls(), vec!["sip:0912345678@pbx.example.com"]);
        assert_eq!(controller.snapshot().state, CallState::OutgoingRinging);
        assert_eq!(
            controller.snapshot().remote_identity.as_deref(),
            Some("0912345678")
        );
        assert!(signaling.sessions()[0].has_payload_filter());
    }
}
