//! Loopback transports
//!
//! [`MemoryBroker`] behaves like a small STOMP broker living in process:
//! every [`MemoryPubSub`] it creates shares its topic table, publishes are
//! recorded for inspection, and frames can be injected on any topic.
//! [`MemorySignaling`] plays the part of a SIP user agent whose registrar
//! and remote peers are scripted from the outside.
//!
//! Both are fully functional implementations of the transport contracts;
//! the test-suite and the `confab` demo binary run the real sessions on
//! top of them.
//!
//! ```rust
//! use confab_realtime_core::transport::memory::MemoryBroker;
//! use confab_realtime_core::transport::{PubSubTransport, TransportEvent, TransportFactory};
//! use confab_realtime_core::message::ChannelKey;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = MemoryBroker::new();
//! let transport = broker.create(&ChannelKey::from("group-1"));
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!
//! transport.connect(tx).await?;
//! assert_eq!(rx.recv().await, Some(TransportEvent::Connected));
//!
//! transport.subscribe("/chatroom/telegram").await?;
//! assert_eq!(broker.deliver("/chatroom/telegram", "{}"), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::signaling::{
    CallDirection, CallOptions, MediaHandle, NegotiationEvent, NegotiationSession, PayloadFilter,
    SignalingEvent, SignalingEventSender, SignalingTransport,
};
use super::{PubSubTransport, SubscriptionHandle, TransportEvent, TransportEventSender, TransportFactory};
use crate::error::{RealtimeError, RealtimeResult};
use crate::message::ChannelKey;

// ===== PUBLISH / SUBSCRIBE =====

/// A frame published through a [`MemoryPubSub`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedFrame {
    /// Channel whose transport published the frame
    pub key: ChannelKey,
    /// Destination the frame was sent to
    pub destination: String,
    /// Serialized body
    pub body: String,
}

struct Link {
    key: ChannelKey,
    events: Option<TransportEventSender>,
    connected: bool,
    subscriptions: HashMap<SubscriptionHandle, String>,
}

#[derive(Default)]
struct BrokerState {
    links: HashMap<u64, Link>,
    refuse_connections: Option<String>,
    fail_publishes: Option<String>,
    fail_disconnects: Option<String>,
    published: Vec<PublishedFrame>,
    connect_attempts: usize,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
}

/// In-process publish/subscribe broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connection attempts fail with `reason` (`None` heals)
    pub fn refuse_connections(&self, reason: Option<&str>) {
        self.inner.state.lock().refuse_connections = reason.map(str::to_string);
    }

    /// Make subsequent publishes fail with `reason` (`None` heals)
    pub fn fail_publishes(&self, reason: Option<&str>) {
        self.inner.state.lock().fail_publishes = reason.map(str::to_string);
    }

    /// Make subsequent client disconnects fail with `reason` (`None` heals)
    ///
    /// A failing disconnect leaves the link and its subscriptions in place.
    pub fn fail_disconnects(&self, reason: Option<&str>) {
        self.inner.state.lock().fail_disconnects = reason.map(str::to_string);
    }

    /// Every frame published so far, in order
    pub fn published(&self) -> Vec<PublishedFrame> {
        self.inner.state.lock().published.clone()
    }

    /// Number of transports created by this broker
    pub fn links_created(&self) -> usize {
        self.inner.state.lock().links.len()
    }

    /// Number of `connect` calls seen across all transports
    pub fn connect_attempts(&self) -> usize {
        self.inner.state.lock().connect_attempts
    }

    /// Number of live subscriptions on `topic` across all transports
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.inner
            .state
            .lock()
            .links
            .values()
            .flat_map(|link| link.subscriptions.values())
            .filter(|t| t.as_str() == topic)
            .count()
    }

    /// Deliver a raw frame to every subscription on `topic`
    ///
    /// Returns how many subscriptions received it.
    pub fn deliver(&self, topic: &str, body: &str) -> usize {
        let state = self.inner.state.lock();
        let mut delivered = 0;
        for link in state.links.values().filter(|link| link.connected) {
            let Some(events) = &link.events else { continue };
            for (handle, subscribed) in &link.subscriptions {
                if subscribed == topic {
                    let frame = TransportEvent::Frame {
                        subscription: *handle,
                        topic: topic.to_string(),
                        body: body.to_string(),
                    };
                    if events.send(frame).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }

    /// Drop every connected link as if the socket closed underneath it
    pub fn drop_links(&self, reason: &str) {
        self.sever(|| TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Fail every connected link with a broker error
    pub fn fail_links(&self, detail: &str) {
        self.sever(|| TransportEvent::Error {
            detail: detail.to_string(),
        });
    }

    /// Send a broker error to every connected link but keep the socket open
    ///
    /// Unlike [`fail_links`](Self::fail_links), subscriptions survive.
    pub fn report_error(&self, detail: &str) {
        let state = self.inner.state.lock();
        for link in state.links.values().filter(|link| link.connected) {
            if let Some(events) = &link.events {
                let _ = events.send(TransportEvent::Error {
                    detail: detail.to_string(),
                });
            }
        }
    }

    fn sever(&self, event: impl Fn() -> TransportEvent) {
        let mut state = self.inner.state.lock();
        for link in state.links.values_mut().filter(|link| link.connected) {
            link.connected = false;
            link.subscriptions.clear();
            if let Some(events) = &link.events {
                let _ = events.send(event());
            }
        }
    }
}

impl TransportFactory for MemoryBroker {
    fn create(&self, key: &ChannelKey) -> Arc<dyn PubSubTransport> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.state.lock().links.insert(
            id,
            Link {
                key: key.clone(),
                events: None,
                connected: false,
                subscriptions: HashMap::new(),
            },
        );
        Arc::new(MemoryPubSub {
            id,
            broker: self.clone(),
        })
    }
}

/// One connection to a [`MemoryBroker`]
pub struct MemoryPubSub {
    id: u64,
    broker: MemoryBroker,
}

impl MemoryPubSub {
    fn with_link<T>(&self, f: impl FnOnce(&mut BrokerState, u64) -> T) -> T {
        let mut state = self.broker.inner.state.lock();
        f(&mut state, self.id)
    }
}

#[async_trait]
impl PubSubTransport for MemoryPubSub {
    async fn connect(&self, events: TransportEventSender) -> RealtimeResult<()> {
        self.with_link(|state, id| {
            state.connect_attempts += 1;
            if let Some(reason) = state.refuse_connections.clone() {
                return Err(RealtimeError::transport(reason));
            }
            let link = state
                .links
                .get_mut(&id)
                .ok_or_else(|| RealtimeError::transport("link removed"))?;
            link.connected = true;
            let _ = events.send(TransportEvent::Connected);
            link.events = Some(events);
            Ok(())
        })
    }

    async fn disconnect(&self) -> RealtimeResult<()> {
        self.with_link(|state, id| {
            if let Some(reason) = state.fail_disconnects.clone() {
                return Err(RealtimeError::transport(reason));
            }
            if let Some(link) = state.links.get_mut(&id) {
                let was_connected = link.connected;
                link.connected = false;
                link.subscriptions.clear();
                if let (true, Some(events)) = (was_connected, link.events.take()) {
                    let _ = events.send(TransportEvent::Disconnected {
                        reason: "closed by client".to_string(),
                    });
                }
            }
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.with_link(|state, id| state.links.get(&id).map(|l| l.connected).unwrap_or(false))
    }

    async fn subscribe(&self, topic: &str) -> RealtimeResult<SubscriptionHandle> {
        let handle = SubscriptionHandle(self.broker.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.with_link(|state, id| match state.links.get_mut(&id) {
            Some(link) if link.connected => {
                link.subscriptions.insert(handle, topic.to_string());
                Ok(handle)
            }
            _ => Err(RealtimeError::transport("subscribe on a closed connection")),
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> RealtimeResult<()> {
        self.with_link(|state, id| {
            if let Some(link) = state.links.get_mut(&id) {
                link.subscriptions.remove(&handle);
            }
            Ok(())
        })
    }

    async fn publish(&self, destination: &str, body: String) -> RealtimeResult<()> {
        self.with_link(|state, id| {
            if let Some(reason) = state.fail_publishes.clone() {
                return Err(RealtimeError::transport(reason));
            }
            let key = match state.links.get(&id) {
                Some(link) if link.connected => link.key.clone(),
                _ => return Err(RealtimeError::transport("publish on a closed connection")),
            };
            state.published.push(PublishedFrame {
                key,
                destination: destination.to_string(),
                body,
            });
            Ok(())
        })
    }
}

// ===== SIGNALING =====

#[derive(Default)]
struct SignalingState {
    events: Option<SignalingEventSender>,
    refuse_start: Option<String>,
    registration_failure: Option<String>,
    call_failure: Option<String>,
    placed: Vec<String>,
    sessions: Vec<MemoryNegotiation>,
    start_count: usize,
    register_count: usize,
    stop_count: usize,
}

#[derive(Default)]
struct SignalingInner {
    state: Mutex<SignalingState>,
    next_id: AtomicU64,
}

/// In-process signaling user agent with a scripted registrar and peers
#[derive(Clone, Default)]
pub struct MemorySignaling {
    inner: Arc<SignalingInner>,
}

impl MemorySignaling {
    /// Create a user agent that registers successfully
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `start` fail with `reason` (`None` heals)
    pub fn refuse_start(&self, reason: Option<&str>) {
        self.inner.state.lock().refuse_start = reason.map(str::to_string);
    }

    /// Make registrations fail with `detail` (`None` heals)
    pub fn fail_registration(&self, detail: Option<&str>) {
        self.inner.state.lock().registration_failure = detail.map(str::to_string);
    }

    /// Make `call` fail with `reason` (`None` heals)
    pub fn fail_calls(&self, reason: Option<&str>) {
        self.inner.state.lock().call_failure = reason.map(str::to_string);
    }

    /// Number of `start` calls
    pub fn start_count(&self) -> usize {
        self.inner.state.lock().start_count
    }

    /// Number of `register` calls
    pub fn register_count(&self) -> usize {
        self.inner.state.lock().register_count
    }

    /// Number of `stop` calls
    pub fn stop_count(&self) -> usize {
        self.inner.state.lock().stop_count
    }

    /// Targets passed to `call`, in order
    pub fn placed_calls(&self) -> Vec<String> {
        self.inner.state.lock().placed.clone()
    }

    /// Every negotiation session created so far, in order
    pub fn sessions(&self) -> Vec<MemoryNegotiation> {
        self.inner.state.lock().sessions.clone()
    }

    /// Simulate an inbound call from `remote`
    pub fn incoming_call(&self, remote: &str) -> MemoryNegotiation {
        let session = self.new_session(CallDirection::Incoming, remote);
        self.emit(SignalingEvent::NewSession(Arc::new(session.clone())));
        session
    }

    /// Simulate an outgoing session created outside [`SignalingTransport::call`]
    pub fn announce_outgoing(&self, remote: &str) -> MemoryNegotiation {
        let session = self.new_session(CallDirection::Outgoing, remote);
        self.emit(SignalingEvent::NewSession(Arc::new(session.clone())));
        session
    }

    /// Drop the signaling socket
    pub fn drop_connection(&self, reason: &str) {
        self.emit(SignalingEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Emit an arbitrary event to the controller; returns false before `start`
    pub fn emit(&self, event: SignalingEvent) -> bool {
        match &self.inner.state.lock().events {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    fn new_session(&self, direction: CallDirection, remote: &str) -> MemoryNegotiation {
        let id = format!("neg-{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let session = MemoryNegotiation {
            inner: Arc::new(NegotiationInner {
                id,
                direction,
                remote: remote.to_string(),
                signaling: self.clone(),
                filter: Mutex::new(None),
                answer_count: AtomicUsize::new(0),
                terminate_count: AtomicUsize::new(0),
                fail_answer: AtomicBool::new(false),
                fail_terminate: AtomicBool::new(false),
            }),
        };
        self.inner.state.lock().sessions.push(session.clone());
        session
    }
}

fn user_part(target: &str) -> &str {
    let without_scheme = target.strip_prefix("sip:").unwrap_or(target);
    without_scheme.split('@').next().unwrap_or(without_scheme)
}

#[async_trait]
impl SignalingTransport for MemorySignaling {
    async fn start(&self, events: SignalingEventSender) -> RealtimeResult<()> {
        let mut state = self.inner.state.lock();
        state.start_count += 1;
        if let Some(reason) = state.refuse_start.clone() {
            return Err(RealtimeError::transport(reason));
        }
        let _ = events.send(SignalingEvent::Connected);
        state.events = Some(events);
        Ok(())
    }

    async fn register(&self) -> RealtimeResult<()> {
        let mut state = self.inner.state.lock();
        state.register_count += 1;
        let events = state
            .events
            .clone()
            .ok_or_else(|| RealtimeError::transport("register before start"))?;
        let outcome = match state.registration_failure.clone() {
            Some(detail) => SignalingEvent::RegistrationFailed { detail },
            None => SignalingEvent::Registered,
        };
        let _ = events.send(outcome);
        Ok(())
    }

    async fn call(
        &self,
        target: &str,
        _options: &CallOptions,
    ) -> RealtimeResult<Arc<dyn NegotiationSession>> {
        {
            let mut state = self.inner.state.lock();
            if state.events.is_none() {
                return Err(RealtimeError::transport("call before start"));
            }
            if let Some(reason) = state.call_failure.clone() {
                return Err(RealtimeError::negotiation(reason));
            }
            state.placed.push(target.to_string());
        }
        let session = self.new_session(CallDirection::Outgoing, user_part(target));
        Ok(Arc::new(session))
    }

    async fn stop(&self) -> RealtimeResult<()> {
        let mut state = self.inner.state.lock();
        state.stop_count += 1;
        state.events = None;
        Ok(())
    }
}

struct NegotiationInner {
    id: String,
    direction: CallDirection,
    remote: String,
    signaling: MemorySignaling,
    filter: Mutex<Option<PayloadFilter>>,
    answer_count: AtomicUsize,
    terminate_count: AtomicUsize,
    fail_answer: AtomicBool,
    fail_terminate: AtomicBool,
}

/// Negotiation session created by [`MemorySignaling`]
#[derive(Clone)]
pub struct MemoryNegotiation {
    inner: Arc<NegotiationInner>,
}

impl MemoryNegotiation {
    /// Session identifier
    pub fn session_id(&self) -> &str {
        &self.inner.id
    }

    /// Number of `answer` calls
    pub fn answer_count(&self) -> usize {
        self.inner.answer_count.load(Ordering::SeqCst)
    }

    /// Number of `terminate` calls
    pub fn terminate_count(&self) -> usize {
        self.inner.terminate_count.load(Ordering::SeqCst)
    }

    /// Make `answer` fail
    pub fn fail_answer(&self, fail: bool) {
        self.inner.fail_answer.store(fail, Ordering::SeqCst);
    }

    /// Make `terminate` fail
    pub fn fail_terminate(&self, fail: bool) {
        self.inner.fail_terminate.store(fail, Ordering::SeqCst);
    }

    /// Whether a payload filter has been installed
    pub fn has_payload_filter(&self) -> bool {
        self.inner.filter.lock().is_some()
    }

    /// Produce a local description the way the media stack would send it
    pub fn local_description(&self, raw: &str) -> String {
        match self.inner.filter.lock().as_ref() {
            Some(filter) => filter(raw),
            None => raw.to_string(),
        }
    }

    /// The remote party accepts our call
    pub fn accept(&self) -> bool {
        self.notify(NegotiationEvent::Accepted)
    }

    /// The call ends from the remote side
    pub fn end(&self, cause: &str) -> bool {
        self.notify(NegotiationEvent::Ended {
            cause: cause.to_string(),
        })
    }

    /// The call fails at the signaling level
    pub fn fail(&self, detail: &str) -> bool {
        self.notify(NegotiationEvent::Failed {
            detail: detail.to_string(),
        })
    }

    /// Media starts flowing on `stream_id`
    pub fn establish_media(&self, stream_id: &str) -> bool {
        self.notify(NegotiationEvent::PeerConnectionEstablished(MediaHandle {
            stream_id: stream_id.to_string(),
        }))
    }

    fn notify(&self, event: NegotiationEvent) -> bool {
        self.inner.signaling.emit(SignalingEvent::Session {
            session_id: self.inner.id.clone(),
            event,
        })
    }
}

#[async_trait]
impl NegotiationSession for MemoryNegotiation {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn direction(&self) -> CallDirection {
        self.inner.direction
    }

    fn remote_identity(&self) -> String {
        self.inner.remote.clone()
    }

    fn set_payload_filter(&self, filter: PayloadFilter) {
        *self.inner.filter.lock() = Some(filter);
    }

    async fn answer(&self, _options: &CallOptions) -> RealtimeResult<()> {
        self.inner.answer_count.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_answer.load(Ordering::SeqCst) {
            return Err(RealtimeError::negotiation("answer rejected by media layer"));
        }
        Ok(())
    }

    async fn terminate(&self) -> RealtimeResult<()> {
        self.inner.terminate_count.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_terminate.load(Ordering::SeqCst) {
            return Err(RealtimeError::transport("terminate on a dead dialog"));
        }
        self.notify(NegotiationEvent::Ended {
            cause: "Terminated".to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_broker_routes_frames_to_matching_topics() {
        let broker = MemoryBroker::new();
        let a = broker.create(&ChannelKey::from("a"));
        let b = broker.create(&ChannelKey::from("b"));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        a.connect(tx_a).await.unwrap();
        b.connect(tx_b).await.unwrap();
        assert_eq!(rx_a.recv().await, Some(TransportEvent::Connected));
        assert_eq!(rx_b.recv().await, Some(TransportEvent::Connected));

        let handle = a.subscribe("/user/a/messages").await.unwrap();
        b.subscribe("/chatroom/telegram").await.unwrap();

        assert_eq!(broker.deliver("/user/a/messages", "hello"), 1);
        match rx_a.recv().await {
            Some(TransportEvent::Frame { subscription, body, .. }) => {
                assert_eq!(subscription, handle);
                assert_eq!(body, "hello");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let broker = MemoryBroker::new();
        let transport = broker.create(&ChannelKey::from("a"));
        assert!(transport.publish("/app/message", "{}".into()).await.is_err());
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_drop_links_clears_subscriptions() {
        let broker = MemoryBroker::new();
        let transport = broker.create(&ChannelKey::from("a"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();
        transport.subscribe("/t").await.unwrap();
        assert_eq!(broker.subscription_count("/t"), 1);

        broker.drop_links("network down");
        assert_eq!(broker.subscription_count("/t"), 0);
        assert!(!transport.is_connected());
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Disconnected {
                reason: "network down".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_reported_error_keeps_subscriptions() {
        let broker = MemoryBroker::new();
        let transport = broker.create(&ChannelKey::from("a"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();
        transport.subscribe("/t").await.unwrap();

        broker.report_error("receipt timeout");
        broker.fail_disconnects(Some("socket stuck"));
        assert!(transport.disconnect().await.is_err());

        assert_eq!(broker.subscription_count("/t"), 1);
        assert!(transport.is_connected());
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Error {
                detail: "receipt timeout".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_signaling_call_records_target_and_user_part() {
        let signaling = MemorySignaling::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        signaling.start(tx).await.unwrap();

        let session = signaling
            .call("sip:0912345678@pbx.example.com", &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(session.remote_identity(), "0912345678");
        assert_eq!(session.direction(), CallDirection::Outgoing);
        assert_eq!(signaling.placed_calls(), vec!["sip:0912345678@pbx.example.com"]);
    }

    #[tokio::test]
    async fn test_terminate_reports_ended() {
        let signaling = MemorySignaling::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        signaling.start(tx).await.unwrap();
        let _ = rx.recv().await;

        let session = signaling.incoming_call("1001");
        assert!(matches!(rx.recv().await, Some(SignalingEvent::NewSession(_))));

        NegotiationSession::terminate(&session).await.unwrap();
        assert_eq!(session.terminate_count(), 1);
        assert!(matches!(
            rx.recv().await,
            Some(SignalingEvent::Session { event: NegotiationEvent::Ended { .. }, .. })
        ));
    }
}
