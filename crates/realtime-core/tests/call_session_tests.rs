//! Call controller behaviour against the scripted signaling agent

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{within, EventLog, Records, RecordingSink};
use confab_realtime_core::events::RealtimeEvent;
use confab_realtime_core::prelude::*;
use serial_test::serial;

struct Harness {
    orchestrator: SessionOrchestrator,
    signaling: MemorySignaling,
    log: EventLog,
    records: Records,
    sink: Arc<RecordingSink>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(CallConfig::default().with_sip_domain("pbx.example.com"))
    }

    fn with_config(call: CallConfig) -> Self {
        let signaling = MemorySignaling::new();
        let records = Records::default();
        let sink = Arc::new(RecordingSink::default());
        let config = RealtimeConfig {
            call,
            ..RealtimeConfig::default()
        };
        let orchestrator = SessionOrchestrator::builder(config)
            .with_transport_factory(Arc::new(MemoryBroker::new()))
            .with_signaling(Arc::new(signaling.clone()))
            .with_media_sink(sink.clone())
            .with_call_cleanup(records.hook())
            .build()
            .unwrap();
        let log = EventLog::attach(&orchestrator);
        Self {
            orchestrator,
            signaling,
            log,
            records,
            sink,
        }
    }

    async fn registered() -> Self {
        let harness = Self::new();
        harness.orchestrator.start_signaling().await.unwrap();
        harness.wait(|s| s.state == CallState::Ready).await;
        harness
    }

    async fn wait(&self, condition: impl Fn(&CallSnapshot) -> bool) {
        let mut watch = self
            .orchestrator
            .call_controller()
            .unwrap()
            .snapshot_watch();
        within("call snapshot", watch.wait_for(|s| condition(s)))
            .await
            .unwrap();
    }

    /// Let queued signaling events drain; a no-op command while registered
    async fn settle(&self) {
        self.orchestrator.start_signaling().await.unwrap();
    }

    fn call_id(&self) -> CallId {
        self.orchestrator.call_snapshot().unwrap().call_id.unwrap()
    }
}

#[tokio::test]
async fn incoming_call_rings_and_connects_on_answer() {
    let h = Harness::registered().await;

    h.signaling.incoming_call("1001");
    h.wait(|s| s.state == CallState::IncomingRinging).await;
    let call_id = h.call_id();

    let incoming: Vec<_> = h
        .log
        .all()
        .into_iter()
        .filter_map(|event| match event {
            RealtimeEvent::IncomingCall(info) => Some(info),
            _ => None,
        })
        .collect();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].call_id, call_id);
    assert_eq!(incoming[0].remote_identity, "1001");

    h.orchestrator.answer().await.unwrap();
    assert_eq!(h.orchestrator.call_snapshot().unwrap().state, CallState::Connected);
    assert_eq!(h.signaling.sessions()[0].answer_count(), 1);

    let states: Vec<_> = h.log.call_states(call_id).iter().map(|i| i.new_state).collect();
    assert_eq!(states, vec![CallState::IncomingRinging, CallState::Connected]);
}

#[tokio::test]
async fn terminal_event_fires_once_despite_repeated_end_signals() {
    let h = Harness::registered().await;

    let peer = h.signaling.incoming_call("1001");
    h.wait(|s| s.state == CallState::IncomingRinging).await;
    let call_id = h.call_id();
    h.orchestrator.answer().await.unwrap();

    peer.end("Bye");
    peer.fail("Request Terminated");
    peer.end("Bye");
    h.orchestrator.hangup().await.unwrap();
    h.settle().await;

    assert_eq!(h.log.terminal_count(call_id), 1);
    let records = h.records.all();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].final_state, CallState::Ended);
    assert_eq!(records[0].end_reason.as_deref(), Some("Bye"));
    // The call was already over when hangup arrived.
    assert_eq!(peer.terminate_count(), 0);
    assert_eq!(h.orchestrator.call_snapshot().unwrap().state, CallState::Ready);
}

#[tokio::test]
async fn invalid_number_leaves_no_trace() {
    let h = Harness::registered().await;

    for number in ["12345", "091234567890", "09123x5678", ""] {
        let err = h.orchestrator.make_call(number).await.unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidNumber { .. }), "{}", number);
    }
    assert!(h.signaling.placed_calls().is_empty());
    assert!(h.signaling.sessions().is_empty());
    assert!(h.orchestrator.call_snapshot().unwrap().call_id.is_none());

    let call_id = h.orchestrator.make_call("0912345678").await.unwrap();
    assert_eq!(h.signaling.placed_calls(), vec!["sip:0912345678@pbx.example.com"]);
    let states = h.log.call_states(call_id);
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].new_state, CallState::OutgoingRinging);
    assert_eq!(states[0].remote_identity.as_deref(), Some("0912345678"));
}

#[tokio::test]
async fn outgoing_call_connects_when_peer_accepts() {
    let h = Harness::registered().await;

    let call_id = h.orchestrator.make_call("0912345678").await.unwrap();
    let peer = h.signaling.sessions()[0].clone();
    peer.accept();
    h.wait(|s| s.state == CallState::Connected).await;

    h.orchestrator.hangup().await.unwrap();
    assert_eq!(peer.terminate_count(), 1);

    let states: Vec<_> = h.log.call_states(call_id).iter().map(|i| i.new_state).collect();
    assert_eq!(
        states,
        vec![CallState::OutgoingRinging, CallState::Connected, CallState::Ended]
    );
}

#[tokio::test]
async fn hangup_ends_the_call_when_terminate_fails() {
    let h = Harness::registered().await;

    let call_id = h.orchestrator.make_call("0912345678").await.unwrap();
    let peer = h.signaling.sessions()[0].clone();
    peer.accept();
    h.wait(|s| s.state == CallState::Connected).await;
    peer.fail_terminate(true);

    h.orchestrator.hangup().await.unwrap();
    h.orchestrator.hangup().await.unwrap();
    peer.end("Bye");
    h.settle().await;

    assert_eq!(peer.terminate_count(), 1);
    assert_eq!(h.log.terminal_count(call_id), 1);
    let records = h.records.all();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].final_state, CallState::Ended);
    assert_eq!(records[0].end_reason.as_deref(), Some("hangup"));
    assert_eq!(h.orchestrator.call_snapshot().unwrap().state, CallState::Ready);
}

#[tokio::test]
async fn outgoing_session_from_the_agent_is_adopted_as_ringing() {
    let h = Harness::registered().await;

    let peer = h.signaling.announce_outgoing("1002");
    h.wait(|s| s.state == CallState::OutgoingRinging).await;
    let call_id = h.call_id();

    let snapshot = h.orchestrator.call_snapshot().unwrap();
    assert_eq!(snapshot.remote_identity.as_deref(), Some("1002"));
    assert!(peer.has_payload_filter());
    assert!(!h
        .log
        .all()
        .iter()
        .any(|e| matches!(e, RealtimeEvent::IncomingCall(_))));
    assert!(matches!(
        h.orchestrator.answer().await,
        Err(RealtimeError::InvalidState { .. })
    ));

    peer.accept();
    h.wait(|s| s.state == CallState::Connected).await;
    let states: Vec<_> = h.log.call_states(call_id).iter().map(|i| i.new_state).collect();
    assert_eq!(states, vec![CallState::OutgoingRinging, CallState::Connected]);
}

#[tokio::test]
async fn signaling_failure_on_dial_is_a_negotiation_error() {
    let h = Harness::registered().await;
    h.signaling.fail_calls(Some("488 Not Acceptable Here"));

    let err = h.orchestrator.make_call("0912345678").await.unwrap_err();
    assert!(matches!(err, RealtimeError::NegotiationFailure { .. }));
    assert_eq!(h.orchestrator.call_snapshot().unwrap().state, CallState::Ready);
}

#[tokio::test]
async fn new_session_supersedes_the_active_call() {
    let h = Harness::registered().await;

    let first = h.signaling.incoming_call("1001");
    h.wait(|s| s.state == CallState::IncomingRinging).await;
    let first_id = h.call_id();
    h.orchestrator.answer().await.unwrap();

    let second = h.signaling.incoming_call("1002");
    h.wait(|s| s.remote_identity.as_deref() == Some("1002")).await;
    let second_id = h.call_id();
    h.settle().await;

    assert_ne!(first_id, second_id);
    assert_eq!(first.terminate_count(), 1);
    assert_eq!(second.terminate_count(), 0);

    let old_ended = h
        .log
        .position(|e| {
            matches!(e, RealtimeEvent::CallStateChanged(i)
                if i.call_id == Some(first_id) && i.new_state.is_terminal())
        })
        .unwrap();
    let new_ringing = h
        .log
        .position(|e| {
            matches!(e, RealtimeEvent::CallStateChanged(i) if i.call_id == Some(second_id))
        })
        .unwrap();
    assert!(old_ended < new_ringing);

    // The old session's own end report arrives late and is ignored.
    let last_call_event = h
        .log
        .all()
        .into_iter()
        .rev()
        .find_map(|e| match e {
            RealtimeEvent::CallStateChanged(i) if i.call_id.is_some() => i.call_id,
            _ => None,
        });
    assert_eq!(last_call_event, Some(second_id));
    assert_eq!(h.log.terminal_count(first_id), 1);

    let snapshot = h.orchestrator.call_snapshot().unwrap();
    assert_eq!(snapshot.state, CallState::IncomingRinging);
    assert_eq!(h.records.all().len(), 1);
    assert_eq!(h.records.all()[0].call_id, first_id);
}

#[tokio::test]
async fn reject_ends_the_ringing_call() {
    let h = Harness::registered().await;

    let peer = h.signaling.incoming_call("1001");
    h.wait(|s| s.state == CallState::IncomingRinging).await;
    let call_id = h.call_id();

    h.orchestrator.reject().await.unwrap();
    assert_eq!(peer.terminate_count(), 1);
    assert_eq!(peer.answer_count(), 0);
    assert_eq!(h.log.terminal_count(call_id), 1);
    assert_eq!(h.records.all()[0].end_reason.as_deref(), Some("rejected"));

    assert!(matches!(
        h.orchestrator.answer().await,
        Err(RealtimeError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn failed_answer_fails_the_call() {
    let h = Harness::registered().await;

    let peer = h.signaling.incoming_call("1001");
    h.wait(|s| s.state == CallState::IncomingRinging).await;
    peer.fail_answer(true);

    assert!(h.orchestrator.answer().await.is_err());
    let records = h.records.all();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].final_state, CallState::Failed);
    assert!(records[0].answered_at.is_none());
}

#[tokio::test]
async fn media_is_attached_and_released_with_the_call() {
    let h = Harness::registered().await;

    let peer = h.signaling.incoming_call("1001");
    h.wait(|s| s.state == CallState::IncomingRinging).await;
    let call_id = h.call_id();
    h.orchestrator.answer().await.unwrap();

    peer.establish_media("remote-audio-0");
    h.settle().await;
    assert_eq!(
        *h.sink.log.lock(),
        vec![format!("attach:{}:remote-audio-0", call_id)]
    );

    h.orchestrator.hangup().await.unwrap();
    assert_eq!(
        *h.sink.log.lock(),
        vec![
            format!("attach:{}:remote-audio-0", call_id),
            format!("release:{}", call_id),
        ]
    );
}

#[tokio::test]
async fn local_descriptions_are_filtered() {
    let h = Harness::registered().await;
    h.orchestrator.make_call("0912345678").await.unwrap();
    let session = h.signaling.sessions()[0].clone();

    let offer = [
        "v=0",
        "m=audio 9 UDP/TLS/RTP/SAVPF 111",
        "a=candidate:3 1 udp 2122262783 2001:db8:85a3::8a2e:370:7334 50000 typ host",
        "a=candidate:4 1 udp 2122194687 10.0.0.7 50001 typ host",
    ]
    .join("\r\n");

    let sent = session.local_description(&offer);
    assert!(!sent.contains("2001:db8"));
    assert!(sent.contains("10.0.0.7"));
    assert!(sent.starts_with("v=0\r\nm=audio"));
}

#[tokio::test(start_paused = true)]
async fn duration_counts_from_connection_not_ringing() {
    let h = Harness::registered().await;

    h.signaling.incoming_call("1001");
    h.wait(|s| s.state == CallState::IncomingRinging).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.orchestrator.call_duration(), None);

    h.orchestrator.answer().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.orchestrator.call_duration(), Some(Duration::from_secs(5)));

    h.settle().await;
    let ticks = h
        .orchestrator
        .call_controller()
        .unwrap()
        .duration_watch()
        .borrow()
        .unwrap();
    assert!((4..=5).contains(&ticks), "ticks = {}", ticks);

    h.orchestrator.hangup().await.unwrap();
    assert_eq!(h.orchestrator.call_duration(), None);
    let record = &h.records.all()[0];
    assert_eq!(record.duration_secs, 5);
    assert!(record.answered_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn lost_signaling_ends_the_call_and_reconnects() {
    let h = Harness::registered().await;

    let call_id = h.orchestrator.make_call("0912345678").await.unwrap();
    let peer = h.signaling.sessions()[0].clone();
    peer.accept();
    h.wait(|s| s.state == CallState::Connected).await;

    h.signaling.drop_connection("websocket closed");
    h.wait(|s| s.registration == CallState::Failed).await;
    assert_eq!(h.log.terminal_count(call_id), 1);
    assert_eq!(peer.terminate_count(), 0);
    assert!(h.log.statuses().iter().any(|s| {
        s.source == ConnectionSource::Signaling && s.status == ConnectionStatus::Disconnected
    }));

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(h.signaling.start_count(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    h.wait(|s| s.registration == CallState::Ready).await;
    assert_eq!(h.signaling.start_count(), 2);
    assert_eq!(h.signaling.register_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_the_pending_restart() {
    let h = Harness::registered().await;

    h.signaling.drop_connection("websocket closed");
    h.wait(|s| s.registration == CallState::Failed).await;
    h.orchestrator.stop_signaling().await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.signaling.start_count(), 1);
    assert_eq!(h.signaling.stop_count(), 1);
    assert_eq!(h.orchestrator.call_snapshot().unwrap().state, CallState::Idle);
}

#[tokio::test]
async fn registration_failure_is_reported() {
    let h = Harness::new();
    h.signaling.fail_registration(Some("403 Forbidden"));

    h.orchestrator.start_signaling().await.unwrap();
    h.wait(|s| s.registration == CallState::Failed).await;

    let failed = h
        .log
        .statuses()
        .into_iter()
        .find(|s| s.status == ConnectionStatus::RegistrationFailed)
        .unwrap();
    assert_eq!(failed.detail.as_deref(), Some("403 Forbidden"));
    assert!(matches!(
        h.orchestrator.make_call("0912345678").await,
        Err(RealtimeError::NotConnected { .. })
    ));
}

#[tokio::test]
#[serial]
async fn registration_resumes_from_the_persisted_flag() {
    let dir = tempfile::tempdir().unwrap();
    let flag = dir.path().join("sip-connected");
    std::fs::write(&flag, "true").unwrap();

    let h = Harness::with_config(CallConfig::default().with_state_file(&flag));
    h.wait(|s| s.registration == CallState::Ready).await;
    assert_eq!(h.signaling.start_count(), 1);

    h.orchestrator.stop_signaling().await.unwrap();
    assert!(!flag.exists());
}

#[tokio::test]
#[serial]
async fn no_resume_when_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let flag = dir.path().join("sip-connected");
    std::fs::write(&flag, "true").unwrap();

    let h = Harness::with_config(
        CallConfig::default()
            .with_state_file(&flag)
            .with_auto_resume(false),
    );
    // Any reply means the driver is past its resume step.
    h.orchestrator.hangup().await.unwrap();
    assert_eq!(h.signaling.start_count(), 0);
    assert_eq!(h.orchestrator.call_snapshot().unwrap().registration, CallState::Idle);

    h.orchestrator.start_signaling().await.unwrap();
    h.wait(|s| s.registration == CallState::Ready).await;
    assert_eq!(std::fs::read_to_string(&flag).unwrap(), "true");
}
