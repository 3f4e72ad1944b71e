//! Message session: one reconnecting broker connection per channel
//!
//! A [`MessageSession`] is a cheap handle over a command queue. The queue
//! is drained by a single driver task that owns the transport, the
//! subscriptions and the [`Conversation`]. Transport events, reconnect
//! timers and commands are all processed there one at a time, so no state
//! is ever touched from two places.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected --connect--> Connecting --Connected--> Connected
//!      ^                        |                         |
//!      |                  connect error          Disconnected/Error
//!      |                        v                         v
//!      +------disconnect---- Error <-------------- Disconnected
//!                               \___ reconnect timer ___/
//! ```
//!
//! Reconnection uses the flat delay from [`ChannelConfig`]. A manual
//! [`disconnect`](MessageSession::disconnect) cancels any pending timer and
//! stale timer firings are discarded by generation number.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::timeline::{ApplyOutcome, Conversation, ConversationSnapshot};
use super::types::{ChannelKey, InboundMessage, OutboundMessage};
use crate::config::ChannelConfig;
use crate::error::{RealtimeError, RealtimeResult};
use crate::transport::{PubSubTransport, SubscriptionHandle, TransportEvent};

/// Connection state of a message session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected and not trying to
    Disconnected,
    /// Waiting for the transport to come up
    Connecting,
    /// Subscribed and ready to send
    Connected,
    /// The transport failed; a reconnect may be pending
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

/// Status change reported to the session's status listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Connection state after the change
    pub state: ConnectionState,
    /// Transport detail, when there is one
    pub detail: Option<String>,
}

/// Consumer of accepted inbound messages
pub type MessageCallback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Consumer of connection status changes
pub type StatusListener = Arc<dyn Fn(&StatusUpdate) + Send + Sync>;

enum SessionCommand {
    Connect,
    Disconnect {
        done: oneshot::Sender<()>,
    },
    Send {
        message: OutboundMessage,
        reply: oneshot::Sender<RealtimeResult<()>>,
    },
    SetCallback(Option<MessageCallback>),
    SetStatusListener(Option<StatusListener>),
    Snapshot(oneshot::Sender<ConversationSnapshot>),
    Close {
        done: oneshot::Sender<()>,
    },
}

struct SessionHandle {
    key: ChannelKey,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<ConnectionState>,
}

/// Handle to one channel's message session
///
/// Clones refer to the same session; use [`ptr_eq`](Self::ptr_eq) to test
/// identity.
#[derive(Clone)]
pub struct MessageSession {
    inner: Arc<SessionHandle>,
}

impl std::fmt::Debug for MessageSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSession")
            .field("key", &self.inner.key)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl MessageSession {
    /// Spawn the driver for `key`; does not connect
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(key: ChannelKey, transport: Arc<dyn PubSubTransport>, config: ChannelConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let driver = SessionDriver {
            key: key.clone(),
            conversation: Conversation::new(config.broadcast_receiver.clone()),
            transport,
            config,
            state: ConnectionState::Disconnected,
            state_tx,
            subscriptions: Vec::new(),
            callback: None,
            status_listener: None,
            events_tx,
            timer_tx,
            reconnect_generation: 0,
            reconnect_task: None,
            manual_disconnect: false,
        };
        tokio::spawn(driver.run(command_rx, events_rx, timer_rx));

        debug!(key = %key, "Message session created");
        Self {
            inner: Arc::new(SessionHandle {
                key,
                commands,
                state,
            }),
        }
    }

    /// Channel key of this session
    pub fn key(&self) -> &ChannelKey {
        &self.inner.key
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch the connection state
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    /// Whether two handles refer to the same session
    pub fn ptr_eq(&self, other: &MessageSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Start connecting; a no-op if already connecting or connected
    ///
    /// Only enqueues the request, so it is safe to call from a callback.
    pub fn connect(&self) -> RealtimeResult<()> {
        self.enqueue(SessionCommand::Connect)
    }

    /// Tear down subscriptions and the connection; idempotent
    pub async fn disconnect(&self) -> RealtimeResult<()> {
        let (done, wait) = oneshot::channel();
        self.enqueue(SessionCommand::Disconnect { done })?;
        wait.await.map_err(|_| self.closed())
    }

    /// Publish a message
    ///
    /// Fails with [`RealtimeError::NotConnected`] unless the session is
    /// connected. Returns once the message is queued for publishing; a later
    /// publish failure is reported through the status listener.
    pub async fn send(&self, message: OutboundMessage) -> RealtimeResult<()> {
        let (reply, wait) = oneshot::channel();
        self.enqueue(SessionCommand::Send { message, reply })?;
        wait.await.map_err(|_| self.closed())?
    }

    /// Replace the consumer of inbound messages
    pub fn set_callback<F>(&self, callback: F) -> RealtimeResult<()>
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.enqueue(SessionCommand::SetCallback(Some(Arc::new(callback))))
    }

    /// Remove the consumer of inbound messages
    pub fn clear_callback(&self) -> RealtimeResult<()> {
        self.enqueue(SessionCommand::SetCallback(None))
    }

    /// Replace the consumer of status changes
    pub fn set_status_listener<F>(&self, listener: F) -> RealtimeResult<()>
    where
        F: Fn(&StatusUpdate) + Send + Sync + 'static,
    {
        self.enqueue(SessionCommand::SetStatusListener(Some(Arc::new(listener))))
    }

    /// Copy of the conversation state
    pub async fn snapshot(&self) -> RealtimeResult<ConversationSnapshot> {
        let (reply, wait) = oneshot::channel();
        self.enqueue(SessionCommand::Snapshot(reply))?;
        wait.await.map_err(|_| self.closed())
    }

    /// Disconnect and stop the driver; later calls fail with
    /// [`RealtimeError::SessionClosed`]
    pub async fn close(&self) {
        let (done, wait) = oneshot::channel();
        if self.enqueue(SessionCommand::Close { done }).is_ok() {
            let _ = wait.await;
        }
    }

    fn enqueue(&self, command: SessionCommand) -> RealtimeResult<()> {
        self.inner.commands.send(command).map_err(|_| self.closed())
    }

    fn closed(&self) -> RealtimeError {
        RealtimeError::closed(format!("message session {}", self.inner.key))
    }
}

struct SessionDriver {
    key: ChannelKey,
    transport: Arc<dyn PubSubTransport>,
    config: ChannelConfig,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: Vec<SubscriptionHandle>,
    conversation: Conversation,
    callback: Option<MessageCallback>,
    status_listener: Option<StatusListener>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    timer_tx: mpsc::UnboundedSender<u64>,
    reconnect_generation: u64,
    reconnect_task: Option<JoinHandle<()>>,
    manual_disconnect: bool,
}

impl SessionDriver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut timers: mpsc::UnboundedReceiver<u64>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(event) = events.recv() => self.on_transport_event(event).await,

                Some(generation) = timers.recv() => self.on_reconnect_timer(generation).await,

                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
            }
        }
        debug!(key = %self.key, "Message session driver stopped");
    }

    /// Returns false once the session is closed
    async fn on_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Connect => {
                self.manual_disconnect = false;
                self.connect().await;
            }
            SessionCommand::Disconnect { done } => {
                self.teardown().await;
                let _ = done.send(());
            }
            SessionCommand::Send { message, reply } => self.send(message, reply).await,
            SessionCommand::SetCallback(callback) => self.callback = callback,
            SessionCommand::SetStatusListener(listener) => self.status_listener = listener,
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.conversation.snapshot());
            }
            SessionCommand::Close { done } => {
                self.teardown().await;
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    async fn connect(&mut self) {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            debug!(key = %self.key, state = %self.state, "Already connecting or connected");
            return;
        }

        info!(key = %self.key, "Connecting message session");
        self.set_state(ConnectionState::Connecting, None);
        if let Err(e) = self.transport.connect(self.events_tx.clone()).await {
            warn!(key = %self.key, error = %e, category = e.category(), "Transport connect failed");
            self.set_state(ConnectionState::Error, Some(e.to_string()));
            self.schedule_reconnect();
        }
    }

    async fn teardown(&mut self) {
        self.manual_disconnect = true;
        self.cancel_reconnect();
        self.unsubscribe_all().await;
        if let Err(e) = self.transport.disconnect().await {
            warn!(key = %self.key, error = %e, "Transport disconnect failed; treating as disconnected");
        }
        if self.state != ConnectionState::Disconnected {
            info!(key = %self.key, "Message session disconnected");
            self.set_state(ConnectionState::Disconnected, None);
        }
    }

    async fn send(&mut self, message: OutboundMessage, reply: oneshot::Sender<RealtimeResult<()>>) {
        if self.state != ConnectionState::Connected {
            let _ = reply.send(Err(RealtimeError::not_connected("send")));
            return;
        }
        let body = match message.to_wire() {
            Ok(body) => body,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let destination = message.destination(&self.config).to_string();
        let _ = reply.send(Ok(()));

        if let Err(e) = self.transport.publish(&destination, body).await {
            warn!(
                key = %self.key,
                destination = %destination,
                error = %e,
                category = e.category(),
                "Publish failed"
            );
            self.notify_status(StatusUpdate {
                state: ConnectionState::Error,
                detail: Some(e.to_string()),
            });
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected().await,
            TransportEvent::Disconnected { reason } => {
                self.on_link_lost(ConnectionState::Disconnected, reason).await;
            }
            TransportEvent::Error { detail } => {
                self.on_link_lost(ConnectionState::Error, detail).await;
            }
            TransportEvent::Frame {
                subscription,
                topic,
                body,
            } => self.on_frame(subscription, &topic, &body),
        }
    }

    async fn on_connected(&mut self) {
        if self.state != ConnectionState::Connecting {
            debug!(key = %self.key, state = %self.state, "Ignoring stale connected event");
            return;
        }

        // A reconnect must never stack subscriptions on top of old ones.
        self.unsubscribe_all().await;

        let topics = [
            self.config.personal_topic(self.key.as_str()),
            self.config.broadcast_topic.clone(),
        ];
        for topic in topics {
            match self.transport.subscribe(&topic).await {
                Ok(handle) => {
                    debug!(key = %self.key, topic = %topic, subscription = %handle, "Subscribed");
                    self.subscriptions.push(handle);
                }
                Err(e) => {
                    warn!(key = %self.key, topic = %topic, error = %e, "Subscribe failed");
                    self.unsubscribe_all().await;
                    self.set_state(ConnectionState::Error, Some(e.to_string()));
                    self.schedule_reconnect();
                    return;
                }
            }
        }

        info!(key = %self.key, "Message session connected");
        self.set_state(ConnectionState::Connected, None);
    }

    async fn on_link_lost(&mut self, state: ConnectionState, detail: String) {
        if self.state == ConnectionState::Disconnected {
            debug!(key = %self.key, detail = %detail, "Link event after disconnect ignored");
            return;
        }
        warn!(key = %self.key, detail = %detail, state = %state, "Message link lost");
        // An error frame may leave the socket and its subscriptions alive.
        self.unsubscribe_all().await;
        self.set_state(state, Some(detail));
        self.schedule_reconnect();
    }

    fn on_frame(&mut self, subscription: SubscriptionHandle, topic: &str, body: &str) {
        if !self.subscriptions.contains(&subscription) {
            debug!(key = %self.key, subscription = %subscription, "Frame for unknown subscription dropped");
            return;
        }

        let message = match InboundMessage::from_frame(body, Utc::now()) {
            Ok(message) => message,
            Err(e) => {
                warn!(key = %self.key, topic = %topic, error = %e, "Dropping malformed frame");
                return;
            }
        };

        let outcome = self.conversation.apply(message.clone());
        match outcome {
            ApplyOutcome::Duplicate | ApplyOutcome::SkippedContentDuplicate => {
                debug!(key = %self.key, id = ?message.id, outcome = ?outcome, "Duplicate message dropped");
            }
            ApplyOutcome::Ignored => {
                warn!(key = %self.key, status = %message.status, "Unrecognised message status dropped");
            }
            _ => {
                if let Some(callback) = &self.callback {
                    let callback = Arc::clone(callback);
                    if catch_unwind(AssertUnwindSafe(|| callback(&message))).is_err() {
                        warn!(key = %self.key, "Message callback panicked");
                    }
                }
            }
        }
    }

    async fn on_reconnect_timer(&mut self, generation: u64) {
        if generation != self.reconnect_generation || self.manual_disconnect {
            debug!(key = %self.key, generation, "Stale reconnect timer discarded");
            return;
        }
        self.reconnect_task = None;
        info!(key = %self.key, "Reconnecting message session");
        self.connect().await;
    }

    fn schedule_reconnect(&mut self) {
        if self.manual_disconnect {
            return;
        }
        let Some(delay) = self.config.reconnect_delay() else {
            return;
        };
        self.cancel_reconnect();
        let generation = self.reconnect_generation;
        let timers = self.timer_tx.clone();
        debug!(key = %self.key, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        self.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(generation);
        }));
    }

    fn cancel_reconnect(&mut self) {
        self.reconnect_generation += 1;
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }

    async fn unsubscribe_all(&mut self) {
        for handle in std::mem::take(&mut self.subscriptions) {
            if let Err(e) = self.transport.unsubscribe(handle).await {
                debug!(key = %self.key, subscription = %handle, error = %e, "Unsubscribe failed");
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState, detail: Option<String>) {
        if self.state == state && detail.is_none() {
            return;
        }
        self.state = state;
        self.state_tx.send_replace(state);
        self.notify_status(StatusUpdate { state, detail });
    }

    fn notify_status(&self, update: StatusUpdate) {
        if let Some(listener) = &self.status_listener {
            let listener = Arc::clone(listener);
            if catch_unwind(AssertUnwindSafe(|| listener(&update))).is_err() {
                warn!(key = %self.key, "Status listener panicked");
            }
        }
    }
}
