//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use confab_realtime_core::call::{CallId, CallRecord, MediaSink};
use confab_realtime_core::events::RealtimeEvent;
use confab_realtime_core::prelude::*;
use confab_realtime_core::transport::MediaHandle;
use parking_lot::Mutex;
use tokio::sync::watch;

/// Poll `check` until it holds, failing the test after a generous timeout
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Await a future with a timeout
pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

/// Wait until a channel's state watch reaches `state`
pub async fn wait_for_channel(mut watch: watch::Receiver<ConnectionState>, state: ConnectionState) {
    within("channel state", watch.wait_for(|s| *s == state))
        .await
        .expect("session dropped");
}

/// Records every event dispatched by an orchestrator
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<RealtimeEvent>>>,
}

impl EventLog {
    pub fn attach(orchestrator: &SessionOrchestrator) -> Self {
        let log = Self::default();
        let sink = log.events.clone();
        orchestrator.on_message(move |key, message| {
            sink.lock().push(RealtimeEvent::MessageReceived {
                key: key.clone(),
                message: message.clone(),
            });
        });
        let sink = log.events.clone();
        orchestrator.on_call_state_changed(move |info| {
            sink.lock().push(RealtimeEvent::CallStateChanged(info.clone()));
        });
        let sink = log.events.clone();
        orchestrator.on_incoming_call(move |info| {
            sink.lock().push(RealtimeEvent::IncomingCall(info.clone()));
        });
        let sink = log.events.clone();
        orchestrator.on_connection_status_changed(move |info| {
            sink.lock().push(RealtimeEvent::ConnectionStatusChanged(info.clone()));
        });
        log
    }

    pub fn all(&self) -> Vec<RealtimeEvent> {
        self.events.lock().clone()
    }

    /// Call state changes for one call instance
    pub fn call_states(&self, call_id: CallId) -> Vec<CallStatusInfo> {
        self.all()
            .into_iter()
            .filter_map(|event| match event {
                RealtimeEvent::CallStateChanged(info) if info.call_id == Some(call_id) => Some(info),
                _ => None,
            })
            .collect()
    }

    /// Terminal events for one call instance
    pub fn terminal_count(&self, call_id: CallId) -> usize {
        self.call_states(call_id)
            .iter()
            .filter(|info| info.new_state.is_terminal())
            .count()
    }

    /// Position of the first event matching `predicate`
    pub fn position(&self, predicate: impl Fn(&RealtimeEvent) -> bool) -> Option<usize> {
        self.all().iter().position(predicate)
    }

    pub fn messages(&self) -> Vec<InboundMessage> {
        self.all()
            .into_iter()
            .filter_map(|event| match event {
                RealtimeEvent::MessageReceived { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<ConnectionStatusInfo> {
        self.all()
            .into_iter()
            .filter_map(|event| match event {
                RealtimeEvent::ConnectionStatusChanged(info) => Some(info),
                _ => None,
            })
            .collect()
    }
}

/// Media sink that records what it was asked to do
#[derive(Default)]
pub struct RecordingSink {
    pub log: Mutex<Vec<String>>,
}

impl MediaSink for RecordingSink {
    fn attach(&self, call_id: &CallId, media: &MediaHandle) {
        self.log
            .lock()
            .push(format!("attach:{}:{}", call_id, media.stream_id));
    }

    fn release(&self, call_id: &CallId) {
        self.log.lock().push(format!("release:{}", call_id));
    }
}

/// Cleanup hook collector
#[derive(Clone, Default)]
pub struct Records {
    pub records: Arc<Mutex<Vec<CallRecord>>>,
}

impl Records {
    pub fn hook(&self) -> Box<dyn Fn(&CallRecord) + Send + Sync> {
        let records = self.records.clone();
        Box::new(move |record: &CallRecord| records.lock().push(record.clone()))
    }

    pub fn all(&self) -> Vec<CallRecord> {
        self.records.lock().clone()
    }
}

/// A JSON chat frame as the server would send it
pub fn chat_frame(id: Option<&str>, sender: &str, receiver: &str, body: &str, time: &str) -> String {
    let mut frame = serde_json::json!({
        "senderName": sender,
        "receiverName": receiver,
        "message": body,
        "status": "MESSAGE",
        "time": time,
    });
    if let Some(id) = id {
        frame["id"] = serde_json::Value::String(id.to_string());
    }
    frame.to_string()
}
