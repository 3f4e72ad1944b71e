//! Channel registry
//!
//! Maps each [`ChannelKey`] to exactly one [`MessageSession`]. Sessions are
//! created lazily on first request and live until explicitly disposed. The
//! registry is an ordinary value owned by the orchestrator, not a global.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::ChannelConfig;
use crate::message::{ChannelKey, MessageSession};
use crate::transport::TransportFactory;

/// Owner of every live message session
pub struct ChannelRegistry {
    sessions: DashMap<ChannelKey, MessageSession>,
    factory: Arc<dyn TransportFactory>,
    config: ChannelConfig,
}

impl ChannelRegistry {
    /// Create an empty registry; `factory` supplies one transport per key
    pub fn new(factory: Arc<dyn TransportFactory>, config: ChannelConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            factory,
            config,
        }
    }

    /// Return the session for `key`, creating it if needed
    ///
    /// The second element is true when the session was created by this call.
    /// Creation never connects. Must be called from within a tokio runtime.
    pub fn get_or_create(&self, key: &ChannelKey) -> (MessageSession, bool) {
        match self.sessions.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let transport = self.factory.create(key);
                let session = MessageSession::spawn(key.clone(), transport, self.config.clone());
                entry.insert(session.clone());
                info!(key = %key, "Channel registered");
                (session, true)
            }
        }
    }

    /// The session for `key`, if one exists
    pub fn get(&self, key: &ChannelKey) -> Option<MessageSession> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    /// Whether a session exists for `key`
    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry holds no sessions
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Keys of all live sessions, sorted
    pub fn keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<_> = self.sessions.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Close and forget the session for `key`; returns false if unknown
    pub async fn dispose(&self, key: &ChannelKey) -> bool {
        match self.sessions.remove(key) {
            Some((_, session)) => {
                session.close().await;
                debug!(key = %key, "Channel disposed");
                true
            }
            None => false,
        }
    }

    /// Close and forget every session
    pub async fn dispose_all(&self) {
        for key in self.keys() {
            self.dispose(&key).await;
        }
    }
}
