//! Session orchestrator: the facade the presentation layer talks to
//!
//! The orchestrator routes commands to the right message session or to
//! the call controller and fans their events out to listeners. It holds no
//! business state of its own; everything lives in the sessions it owns.
//!
//! # Example
//!
//! ```rust
//! use confab_realtime_core::config::RealtimeConfig;
//! use confab_realtime_core::message::OutboundMessage;
//! use confab_realtime_core::orchestrator::SessionOrchestrator;
//! use confab_realtime_core::transport::memory::{MemoryBroker, MemorySignaling};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = SessionOrchestrator::builder(RealtimeConfig::default())
//!     .with_transport_factory(Arc::new(MemoryBroker::new()))
//!     .with_signaling(Arc::new(MemorySignaling::new()))
//!     .build()?;
//!
//! orchestrator.on_message(|key, message| {
//!     println!("[{}] {}: {}", key, message.sender_id, message.body);
//! });
//!
//! let channel = orchestrator.open_channel("group-1")?;
//! let _ = channel.state();
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::call::{
    validate_number, CallController, CallHooks, CallId, CallRecord, CallSnapshot, FileFlagStore,
    MediaSink, MemoryFlagStore, SessionFlagStore,
};
use crate::config::RealtimeConfig;
use crate::error::{RealtimeError, RealtimeResult};
use crate::events::{
    CallStatusInfo, ConnectionSource, ConnectionStatusInfo, EventDispatcher, EventKind,
    EventStream, IncomingCallInfo, ListenerId, RealtimeEvent,
};
use crate::message::{
    ChannelKey, ConnectionState, ConversationSnapshot, InboundMessage, MessageSession,
    OutboundMessage,
};
use crate::registry::ChannelRegistry;
use crate::transport::{SignalingTransport, TransportFactory};

/// Builder for [`SessionOrchestrator`]
pub struct SessionOrchestratorBuilder {
    config: RealtimeConfig,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    signaling: Option<Arc<dyn SignalingTransport>>,
    flag_store: Option<Arc<dyn SessionFlagStore>>,
    hooks: CallHooks,
}

impl SessionOrchestratorBuilder {
    /// Transport factory used to open message channels (required)
    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Signaling transport; calls are unavailable without one
    pub fn with_signaling(mut self, signaling: Arc<dyn SignalingTransport>) -> Self {
        self.signaling = Some(signaling);
        self
    }

    /// Store for the "was connected" flag
    ///
    /// Defaults to a file store when `call.state_file` is configured and to
    /// an in-memory store otherwise.
    pub fn with_flag_store(mut self, store: Arc<dyn SessionFlagStore>) -> Self {
        self.flag_store = Some(store);
        self
    }

    /// Sink for remote call media
    pub fn with_media_sink(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.hooks.media = Some(sink);
        self
    }

    /// Hook called with the record of every finished call
    pub fn with_call_cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: Fn(&CallRecord) + Send + Sync + 'static,
    {
        self.hooks.cleanup = Some(Arc::new(cleanup));
        self
    }

    /// Validate the configuration and start the call controller
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> RealtimeResult<SessionOrchestrator> {
        self.config.validate()?;
        let factory = self
            .transport_factory
            .ok_or_else(|| RealtimeError::config("a transport factory is required"))?;

        let dispatcher = Arc::new(EventDispatcher::new(self.config.call.event_capacity));

        let calls = self.signaling.map(|signaling| {
            let store: Arc<dyn SessionFlagStore> = match (self.flag_store, &self.config.call.state_file) {
                (Some(store), _) => store,
                (None, Some(path)) => Arc::new(FileFlagStore::new(path.clone())),
                (None, None) => Arc::new(MemoryFlagStore::default()),
            };
            CallController::spawn(
                signaling,
                self.config.call.clone(),
                store,
                Arc::clone(&dispatcher),
                self.hooks,
            )
        });

        info!(signaling = calls.is_some(), "Session orchestrator ready");
        Ok(SessionOrchestrator {
            number_range: (
                self.config.call.number_min_digits,
                self.config.call.number_max_digits,
            ),
            registry: ChannelRegistry::new(factory, self.config.channel),
            calls,
            dispatcher,
        })
    }
}

/// A channel as seen from outside the orchestrator
///
/// Exposes the channel's commands and state but not its consumers, which
/// stay wired to the orchestrator's listeners.
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    session: MessageSession,
}

impl ChannelHandle {
    /// Channel key
    pub fn key(&self) -> &ChannelKey {
        self.session.key()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Watch the connection state
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.session.state_watch()
    }

    /// Whether two handles refer to the same channel
    pub fn ptr_eq(&self, other: &ChannelHandle) -> bool {
        self.session.ptr_eq(&other.session)
    }

    /// Start connecting; a no-op if already connecting or connected
    pub fn connect(&self) -> RealtimeResult<()> {
        self.session.connect()
    }

    /// Tear down the connection; the channel stays registered
    pub async fn disconnect(&self) -> RealtimeResult<()> {
        self.session.disconnect().await
    }

    /// Publish a message; see [`MessageSession::send`]
    pub async fn send(&self, message: OutboundMessage) -> RealtimeResult<()> {
        self.session.send(message).await
    }

    /// Copy of the conversation state
    pub async fn snapshot(&self) -> RealtimeResult<ConversationSnapshot> {
        self.session.snapshot().await
    }
}

/// Facade over channels, calls and event listeners
pub struct SessionOrchestrator {
    number_range: (usize, usize),
    registry: ChannelRegistry,
    calls: Option<CallController>,
    dispatcher: Arc<EventDispatcher>,
}

impl SessionOrchestrator {
    /// Start building an orchestrator
    pub fn builder(config: RealtimeConfig) -> SessionOrchestratorBuilder {
        SessionOrchestratorBuilder {
            config,
            transport_factory: None,
            signaling: None,
            flag_store: None,
            hooks: CallHooks::default(),
        }
    }

    // ===== CHANNELS =====

    /// Get or create the channel for `key` and start connecting it
    pub fn open_channel(&self, key: impl Into<ChannelKey>) -> RealtimeResult<ChannelHandle> {
        let key = key.into();
        let (session, created) = self.registry.get_or_create(&key);
        if created {
            self.wire_channel(&session)?;
        }
        session.connect()?;
        Ok(ChannelHandle { session })
    }

    fn wire_channel(&self, session: &MessageSession) -> RealtimeResult<()> {
        let key = session.key().clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        session.set_callback(move |message: &InboundMessage| {
            dispatcher.dispatch(RealtimeEvent::MessageReceived {
                key: key.clone(),
                message: message.clone(),
            });
        })?;

        let key = session.key().clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        session.set_status_listener(move |update| {
            dispatcher.dispatch(RealtimeEvent::ConnectionStatusChanged(ConnectionStatusInfo::now(
                ConnectionSource::Channel(key.clone()),
                update.state.into(),
                update.detail.clone(),
            )));
        })
    }

    /// The channel for `key`, if it was opened
    pub fn channel(&self, key: &ChannelKey) -> Option<ChannelHandle> {
        self.registry.get(key).map(|session| ChannelHandle { session })
    }

    /// Keys of all open channels
    pub fn channel_keys(&self) -> Vec<ChannelKey> {
        self.registry.keys()
    }

    /// Disconnect and forget the channel for `key`
    pub async fn close_channel(&self, key: &ChannelKey) -> bool {
        self.registry.dispose(key).await
    }

    /// Publish on the channel for `key`
    ///
    /// Fails with [`RealtimeError::NotConnected`] when the channel was never
    /// opened or is not connected.
    pub async fn send_to(&self, key: &ChannelKey, message: OutboundMessage) -> RealtimeResult<()> {
        let session = self
            .registry
            .get(key)
            .ok_or_else(|| RealtimeError::not_connected("send_to"))?;
        session.send(message).await
    }

    /// Conversation state of the channel for `key`
    pub async fn conversation(&self, key: &ChannelKey) -> RealtimeResult<ConversationSnapshot> {
        let session = self
            .registry
            .get(key)
            .ok_or_else(|| RealtimeError::invalid_state(format!("channel {} is not open", key)))?;
        session.snapshot().await
    }

    // ===== CALLS =====

    fn calls(&self, operation: &str) -> RealtimeResult<&CallController> {
        self.calls
            .as_ref()
            .ok_or_else(|| RealtimeError::not_connected(operation))
    }

    /// Start signaling and register
    pub async fn start_signaling(&self) -> RealtimeResult<()> {
        self.calls("start_signaling")?.start().await
    }

    /// Stop signaling and clear the persisted flag
    pub async fn stop_signaling(&self) -> RealtimeResult<()> {
        match &self.calls {
            Some(calls) => calls.stop().await,
            None => Ok(()),
        }
    }

    /// Dial `number`
    ///
    /// The number is validated first, so an invalid one fails with
    /// [`RealtimeError::InvalidNumber`] even without signaling.
    pub async fn make_call(&self, number: &str) -> RealtimeResult<CallId> {
        let (min, max) = self.number_range;
        validate_number(number, min, max)?;
        self.calls("make_call")?.make_call(number).await
    }

    /// Answer the ringing inbound call
    pub async fn answer(&self) -> RealtimeResult<()> {
        self.calls("answer")?.answer().await
    }

    /// Reject the ringing inbound call
    pub async fn reject(&self) -> RealtimeResult<()> {
        self.calls("reject")?.reject().await
    }

    /// Hang up the active call; a no-op when there is none
    pub async fn hangup(&self) -> RealtimeResult<()> {
        match &self.calls {
            Some(calls) => calls.hangup().await,
            None => Ok(()),
        }
    }

    /// Current call state, when signaling is configured
    pub fn call_snapshot(&self) -> Option<CallSnapshot> {
        self.calls.as_ref().map(CallController::snapshot)
    }

    /// Time connected on the active call
    pub fn call_duration(&self) -> Option<Duration> {
        self.calls.as_ref().and_then(CallController::duration)
    }

    /// The call controller, when signaling is configured
    pub fn call_controller(&self) -> Option<&CallController> {
        self.calls.as_ref()
    }

    // ===== LISTENERS =====

    /// Listen for accepted messages on every channel
    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ChannelKey, &InboundMessage) + Send + Sync + 'static,
    {
        self.dispatcher.add_listener(EventKind::Message, move |event| {
            if let RealtimeEvent::MessageReceived { key, message } = event {
                listener(key, message);
            }
        })
    }

    /// Listen for call and registration state changes
    pub fn on_call_state_changed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CallStatusInfo) + Send + Sync + 'static,
    {
        self.dispatcher.add_listener(EventKind::CallState, move |event| {
            if let RealtimeEvent::CallStateChanged(info) = event {
                listener(info);
            }
        })
    }

    /// Listen for ringing inbound calls
    pub fn on_incoming_call<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&IncomingCallInfo) + Send + Sync + 'static,
    {
        self.dispatcher.add_listener(EventKind::IncomingCall, move |event| {
            if let RealtimeEvent::IncomingCall(info) = event {
                listener(info);
            }
        })
    }

    /// Listen for channel and signaling status changes
    pub fn on_connection_status_changed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionStatusInfo) + Send + Sync + 'static,
    {
        self.dispatcher
            .add_listener(EventKind::ConnectionStatus, move |event| {
                if let RealtimeEvent::ConnectionStatusChanged(info) = event {
                    listener(info);
                }
            })
    }

    /// Remove a listener added through any `on_*` method
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(id)
    }

    /// Async stream of every event
    pub fn subscribe(&self) -> EventStream {
        self.dispatcher.subscribe()
    }

    /// Close every channel and stop signaling
    pub async fn shutdown(&self) {
        self.registry.dispose_all().await;
        if let Some(calls) = &self.calls {
            calls.shutdown().await;
        }
        debug!("Session orchestrator shut down");
    }
}
