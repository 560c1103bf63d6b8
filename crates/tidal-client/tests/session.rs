mod common;

use std::time::Duration;

use common::{
    drain_logs, start, start_loaded, start_with, test_config, MockPeerFactory, PeerCall,
};
use tidal_client::{MemoryConnector, NegotiationState, PeerConnectionState, PeerEvent, TrackKind};
use tidal_common::{Error, Severity, SignalMessage, SourceInfo};
use tidal_quality::{HostLoad, Metric, QualityLabel, QualityProfile};

const BUSY_HOST: HostLoad = HostLoad {
    cpu_percent: 85.0,
    memory_percent: 40.0,
};

fn answer() -> SignalMessage {
    SignalMessage::Answer {
        sdp: "v=0 mock-answer".into(),
    }
}

fn remote(candidate: &str) -> SignalMessage {
    SignalMessage::IceCandidate {
        candidate: candidate.into(),
    }
}

fn local(candidate: &str) -> PeerEvent {
    PeerEvent::LocalCandidate(candidate.into())
}

#[tokio::test]
async fn test_connect_sends_offer_with_stream_config() {
    let mut config = test_config();
    config.stream.source_type = "camera-0".into();
    config.stream.enable_audio = true;
    let h = start(config).await;

    h.handle.connect().await.unwrap();

    assert_eq!(h.handle.current_state(), NegotiationState::Negotiating);
    let offers = h.offers();
    assert_eq!(offers.len(), 1);
    match &offers[0] {
        SignalMessage::Offer { sdp, config } => {
            assert_eq!(sdp, "v=0 mock-offer");
            assert_eq!(config.source_type, "camera-0");
            assert!(config.enable_audio);
            assert_eq!(config.resolution, (1920, 1080));
        }
        other => panic!("expected offer, got {other:?}"),
    }
    assert_eq!(
        h.peers.last_peer().calls(),
        vec![
            PeerCall::CreateOffer,
            PeerCall::SetLocal("v=0 mock-offer".into())
        ]
    );
}

#[tokio::test]
async fn test_remote_candidates_applied_in_receipt_order_around_answer() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();

    h.host_says(remote("r1")).await;
    h.host_says(remote("r2")).await;
    assert!(h.peers.last_peer().added_candidates().is_empty());

    h.host_says(answer()).await;
    h.host_says(remote("r3")).await;
    h.host_says(remote("r4")).await;

    let peer = h.peers.last_peer();
    assert_eq!(peer.added_candidates(), vec!["r1", "r2", "r3", "r4"]);

    let calls = peer.calls();
    let remote_at = calls
        .iter()
        .position(|c| matches!(c, PeerCall::SetRemote(_)))
        .unwrap();
    let first_add = calls
        .iter()
        .position(|c| matches!(c, PeerCall::AddCandidate(_)))
        .unwrap();
    assert!(remote_at < first_add);
}

#[tokio::test]
async fn test_local_candidates_held_until_answer_then_flushed_once() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();

    h.peer_says(local("l1")).await;
    h.peer_says(local("l2")).await;
    assert!(h.sent_candidates().is_empty());

    h.host_says(answer()).await;
    assert_eq!(h.sent_candidates(), vec!["l1", "l2"]);

    h.peer_says(local("l3")).await;
    assert_eq!(h.sent_candidates(), vec!["l1", "l2", "l3"]);

    // A duplicate answer must not flush anything again.
    h.host_says(answer()).await;
    assert_eq!(h.sent_candidates(), vec!["l1", "l2", "l3"]);
}

#[tokio::test]
async fn test_disconnect_from_idle_is_idempotent() {
    let h = start(test_config()).await;
    let mut logs = h.handle.logs();

    h.handle.disconnect().await.unwrap();
    h.handle.disconnect().await.unwrap();

    assert_eq!(h.handle.current_state(), NegotiationState::Idle);
    assert!(!h.host.is_open());
    let disconnects = drain_logs(&mut logs)
        .iter()
        .filter(|e| e.message == "Disconnected")
        .count();
    assert_eq!(disconnects, 1);
}

#[tokio::test]
async fn test_disconnect_while_negotiating_releases_everything() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();
    h.peer_says(local("l1")).await;

    h.handle.disconnect().await.unwrap();

    assert_eq!(h.handle.current_state(), NegotiationState::Idle);
    assert!(h.peers.last_peer().is_closed());
    assert!(!h.host.is_open());
    assert!(h.sent_candidates().is_empty());

    h.handle.disconnect().await.unwrap();
    assert_eq!(h.handle.current_state(), NegotiationState::Idle);
    let closes = h
        .peers
        .last_peer()
        .calls()
        .iter()
        .filter(|c| **c == PeerCall::Close)
        .count();
    assert_eq!(closes, 1);
}

#[tokio::test]
async fn test_disconnect_while_connected_stops_telemetry() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();
    h.host_says(answer()).await;
    h.peer_says(PeerEvent::StateChanged(PeerConnectionState::Connected))
        .await;
    assert_eq!(h.handle.current_state(), NegotiationState::Connected);

    let mut metrics = h.handle.metrics();
    tokio::time::timeout(Duration::from_secs(5), metrics.changed())
        .await
        .expect("no metrics while connected")
        .unwrap();
    assert!(h.peers.last_peer().stats_polls() > 0);

    h.handle.disconnect().await.unwrap();
    assert_eq!(h.handle.current_state(), NegotiationState::Idle);

    let peer = h.peers.last_peer();
    let polls = peer.stats_polls();
    tokio::time::sleep(Duration::from_millis(80)).await;
    h.handle.settle().await.unwrap();
    assert_eq!(peer.stats_polls(), polls);

    let calls = peer.calls();
    let close_at = calls.iter().position(|c| *c == PeerCall::Close).unwrap();
    assert!(calls[close_at..]
        .iter()
        .all(|c| !matches!(c, PeerCall::GetStats)));
}

#[tokio::test]
async fn test_disconnect_from_failed_returns_to_idle() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();
    h.peer_says(PeerEvent::StateChanged(PeerConnectionState::Failed))
        .await;

    assert_eq!(h.handle.current_state(), NegotiationState::Failed);
    assert!(h.peers.last_peer().is_closed());

    h.handle.disconnect().await.unwrap();
    h.handle.disconnect().await.unwrap();
    assert_eq!(h.handle.current_state(), NegotiationState::Idle);
}

#[tokio::test]
async fn test_telemetry_not_sampled_before_connected() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();
    h.host_says(answer()).await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    h.handle.settle().await.unwrap();
    assert_eq!(h.peers.last_peer().stats_polls(), 0);
    assert!(h.handle.metrics().borrow().is_none());
}

#[tokio::test]
async fn test_metrics_export_is_published() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();
    h.host_says(answer()).await;
    h.peer_says(PeerEvent::StateChanged(PeerConnectionState::Connected))
        .await;

    let mut metrics = h.handle.metrics();
    let export = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            metrics.changed().await.unwrap();
            let export = metrics.borrow_and_update().clone();
            if let Some(export) = export {
                if export.metrics.fps > 0.0 {
                    return export;
                }
            }
        }
    })
    .await
    .expect("no rate sample");

    assert!(export.metrics.bitrate_kbps > 0.0);
    assert!((export.metrics.rtt_ms - 30.0).abs() < 1e-6);
    assert_eq!(export.metrics.cpu_percent, 20.0);
    assert!(export.score <= 100);
    assert!(!export.history.is_empty());
}

#[tokio::test]
async fn test_malformed_payload_is_discarded_once() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();
    let mut logs = h.handle.logs();

    assert!(h.host.deliver_text("{not json"));
    h.handle.settle().await.unwrap();

    assert_eq!(h.handle.current_state(), NegotiationState::Negotiating);
    let discards: Vec<_> = drain_logs(&mut logs)
        .into_iter()
        .filter(|e| e.message.starts_with("Discarded signaling message"))
        .collect();
    assert_eq!(discards.len(), 1);
    assert_eq!(discards[0].severity, Severity::Warning);
}

#[tokio::test]
async fn test_host_error_is_logged_without_state_change() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();
    let mut logs = h.handle.logs();

    h.host_says(SignalMessage::Error {
        message: "encoder unavailable".into(),
    })
    .await;

    assert_eq!(h.handle.current_state(), NegotiationState::Negotiating);
    assert!(drain_logs(&mut logs)
        .iter()
        .any(|e| e.severity == Severity::Error && e.message.contains("encoder unavailable")));
}

#[tokio::test]
async fn test_signaling_loss_while_connected_disconnects() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();
    h.host_says(answer()).await;
    h.peer_says(PeerEvent::StateChanged(PeerConnectionState::Connected))
        .await;

    assert!(h.host.close_remote());
    h.handle.settle().await.unwrap();

    assert_eq!(h.handle.current_state(), NegotiationState::Disconnected);
    assert!(h.peers.last_peer().is_closed());
}

#[tokio::test]
async fn test_source_list_selects_source_and_connects() {
    let mut config = test_config();
    config.auto_connect_on_sources = true;
    let h = start(config).await;

    h.host_says(SignalMessage::SourceList {
        sources: vec![
            SourceInfo {
                id: "x11-0".into(),
                name: "Left".into(),
                source_type: "screen".into(),
                resolution: "1920x1080".into(),
                primary: false,
            },
            SourceInfo {
                id: "x11-1".into(),
                name: "Right".into(),
                source_type: "screen".into(),
                resolution: "2560x1440".into(),
                primary: true,
            },
        ],
    })
    .await;

    assert_eq!(h.handle.current_state(), NegotiationState::Negotiating);
    assert_eq!(h.handle.inventory().borrow().sources.len(), 2);
    match h.offers().as_slice() {
        [SignalMessage::Offer { config, .. }] => assert_eq!(config.source_type, "x11-1"),
        other => panic!("expected one offer, got {other:?}"),
    }
}

#[tokio::test]
async fn test_explicit_source_is_kept() {
    let mut config = test_config();
    config.stream.source_type = "camera-0".into();
    config.source_explicit = true;
    let h = start(config).await;

    h.host_says(SignalMessage::SourceList {
        sources: vec![SourceInfo {
            id: "x11-0".into(),
            name: "Screen".into(),
            source_type: "screen".into(),
            resolution: "1920x1080".into(),
            primary: true,
        }],
    })
    .await;
    h.handle.connect().await.unwrap();

    match h.offers().as_slice() {
        [SignalMessage::Offer { config, .. }] => assert_eq!(config.source_type, "camera-0"),
        other => panic!("expected one offer, got {other:?}"),
    }
}

#[tokio::test]
async fn test_denied_microphone_is_dropped_from_offer() {
    let mut config = test_config();
    config.stream.enable_microphone_input = true;
    let h = start(config).await;
    let mut logs = h.handle.logs();

    h.handle.connect().await.unwrap();

    match h.offers().as_slice() {
        [SignalMessage::Offer { config, .. }] => assert!(!config.enable_microphone_input),
        other => panic!("expected one offer, got {other:?}"),
    }
    assert!(drain_logs(&mut logs)
        .iter()
        .any(|e| e.severity == Severity::Warning && e.message.contains("microphone")));
}

#[tokio::test]
async fn test_granted_microphone_stays_in_offer() {
    let mut config = test_config();
    config.stream.enable_microphone_input = true;
    let peers = MockPeerFactory::default();
    peers.allow_microphone(true);
    let h = start_with(config, peers, MemoryConnector::new()).await;

    h.handle.connect().await.unwrap();

    assert!(h
        .peers
        .last_peer()
        .calls()
        .contains(&PeerCall::EnableMicrophone));
    match h.offers().as_slice() {
        [SignalMessage::Offer { config, .. }] => assert!(config.enable_microphone_input),
        other => panic!("expected one offer, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_without_signaling_is_aborted() {
    let host = MemoryConnector::new();
    host.refuse_connections(true);
    let h = start_with(test_config(), MockPeerFactory::default(), host).await;

    let result = h.handle.connect().await;

    assert!(matches!(result, Err(Error::ChannelClosed)));
    assert_eq!(h.handle.current_state(), NegotiationState::Idle);
    assert_eq!(h.peers.created(), 0);
}

#[tokio::test]
async fn test_reconnect_replaces_session_and_ignores_stale_events() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();
    h.handle.connect().await.unwrap();

    assert_eq!(h.peers.created(), 2);
    assert!(h.peers.peer(0).is_closed());
    assert!(!h.peers.peer(1).is_closed());
    assert_eq!(h.offers().len(), 2);

    h.peers
        .emit_on(0, PeerEvent::StateChanged(PeerConnectionState::Connected));
    h.peers.emit_on(0, local("stale"));
    h.handle.settle().await.unwrap();
    assert_eq!(h.handle.current_state(), NegotiationState::Negotiating);

    h.host_says(answer()).await;
    assert!(h.sent_candidates().is_empty());
}

#[tokio::test]
async fn test_answer_timeout_fails_attempt() {
    let mut config = test_config();
    config.answer_timeout = Some(Duration::from_millis(30));
    let h = start(config).await;

    h.handle.connect().await.unwrap();
    h.wait_for_state(NegotiationState::Failed).await;
    assert!(h.peers.last_peer().is_closed());
}

#[tokio::test]
async fn test_answer_timeout_disarmed_once_connected() {
    let mut config = test_config();
    config.answer_timeout = Some(Duration::from_millis(30));
    let h = start(config).await;

    h.handle.connect().await.unwrap();
    h.host_says(answer()).await;
    h.peer_says(PeerEvent::StateChanged(PeerConnectionState::Connected))
        .await;

    tokio::time::sleep(Duration::from_millis(80)).await;
    h.handle.settle().await.unwrap();
    assert_eq!(h.handle.current_state(), NegotiationState::Connected);
}

#[tokio::test]
async fn test_track_events_are_logged() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();
    let mut logs = h.handle.logs();

    h.peer_says(PeerEvent::Track(TrackKind::Video)).await;

    assert!(drain_logs(&mut logs)
        .iter()
        .any(|e| e.message == "Receiving video track"));
}

#[tokio::test]
async fn test_immersive_request_is_unsupported() {
    let h = start(test_config()).await;
    assert!(matches!(
        h.handle.request_immersive(),
        Err(Error::UnsupportedCapability(_))
    ));
    assert_eq!(h.handle.current_state(), NegotiationState::Idle);
}

#[tokio::test]
async fn test_shutdown_stops_driver() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();
    h.handle.shutdown().await.unwrap();

    assert!(h.peers.last_peer().is_closed());
    assert!(h.handle.settle().await.is_err());
}

#[tokio::test]
async fn test_first_export_already_has_rates() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();
    h.establish().await;

    let mut metrics = h.handle.metrics();
    tokio::time::timeout(Duration::from_secs(5), metrics.changed())
        .await
        .expect("no metrics while connected")
        .unwrap();
    let export = metrics.borrow_and_update().clone().unwrap();

    assert!(export.metrics.fps > 0.0);
    assert!(export.issues.iter().all(|i| i.metric != Metric::Fps));
    assert_eq!(export.history.get(&Metric::Fps).map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_profile_changes_leave_configured_capture_untouched() {
    let mut config = test_config();
    config.stream.resolution = (1280, 720);
    let h = start(config).await;
    let mut logs = h.handle.logs();

    h.handle.connect().await.unwrap();
    h.establish().await;
    let peer = h.peers.last_peer();
    h.wait_until("a few stats polls", |_| peer.stats_polls() >= 4)
        .await;

    // A healthy stream capped at the configured size is the initial profile.
    let profile = *h.handle.profile().borrow();
    assert_eq!(profile, QualityProfile::HIGH.capped((1280, 720), 30));
    assert!(!drain_logs(&mut logs)
        .iter()
        .any(|e| e.message.starts_with("Quality profile")));

    h.handle.disconnect().await.unwrap();
    h.handle.connect().await.unwrap();
    let streams = h.offered_streams();
    assert_eq!(streams.len(), 2);
    assert_eq!(streams[1].resolution, (1280, 720));
    assert_eq!(streams[1].framerate, 30);
}

#[tokio::test]
async fn test_profile_change_without_renegotiation_keeps_offer() {
    let h = start_loaded(test_config(), BUSY_HOST).await;
    h.handle.connect().await.unwrap();
    h.establish().await;

    h.wait_until("medium profile", |h| {
        h.handle.profile().borrow().label == QualityLabel::Medium
    })
    .await;
    assert_eq!(*h.handle.profile().borrow(), QualityProfile::MEDIUM);
    assert_eq!(h.offers().len(), 1);
    assert_eq!(h.peers.created(), 1);

    h.handle.disconnect().await.unwrap();
    h.handle.connect().await.unwrap();
    let streams = h.offered_streams();
    assert_eq!(streams[1].resolution, (1920, 1080));
    assert_eq!(streams[1].framerate, 30);
}

#[tokio::test]
async fn test_profile_change_renegotiates_with_new_capture() {
    let mut config = test_config();
    config.renegotiate_on_profile_change = true;
    let h = start_loaded(config, BUSY_HOST).await;
    let mut logs = h.handle.logs();

    h.handle.connect().await.unwrap();
    h.establish().await;
    h.wait_until("a second offer", |h| h.offers().len() >= 2)
        .await;

    let streams = h.offered_streams();
    assert_eq!(streams[0].resolution, (1920, 1080));
    assert_eq!(streams[1].resolution, (1280, 720));
    assert_eq!(streams[1].framerate, 24);
    assert_eq!(h.handle.profile().borrow().label, QualityLabel::Medium);

    assert!(h.peers.peer(0).is_closed());
    assert_eq!(h.handle.current_state(), NegotiationState::Negotiating);
    let logs = drain_logs(&mut logs);
    assert!(logs
        .iter()
        .any(|e| e.message.starts_with("Quality profile medium: 1280x720 @ 24 fps")));
    assert!(logs
        .iter()
        .any(|e| e.message == "Renegotiating with new capture parameters"));
}

#[tokio::test]
async fn test_peer_disconnected_fails_attempt() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();
    h.establish().await;

    h.peer_says(PeerEvent::StateChanged(PeerConnectionState::Disconnected))
        .await;

    assert_eq!(h.handle.current_state(), NegotiationState::Failed);
    assert!(h.peers.last_peer().is_closed());
}

#[tokio::test]
async fn test_peer_closed_stops_telemetry() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();
    h.establish().await;
    let peer = h.peers.last_peer();
    h.wait_until("a stats poll", |_| peer.stats_polls() > 0).await;

    h.peer_says(PeerEvent::StateChanged(PeerConnectionState::Closed))
        .await;
    assert_eq!(h.handle.current_state(), NegotiationState::Closed);
    assert!(peer.is_closed());

    let polls = peer.stats_polls();
    tokio::time::sleep(Duration::from_millis(80)).await;
    h.handle.settle().await.unwrap();
    assert_eq!(peer.stats_polls(), polls);
}

#[tokio::test]
async fn test_transport_error_while_negotiating_disconnects() {
    let h = start(test_config()).await;
    h.handle.connect().await.unwrap();
    let mut logs = h.handle.logs();

    assert!(h.host.fail("connection reset"));
    h.handle.settle().await.unwrap();

    assert_eq!(h.handle.current_state(), NegotiationState::Disconnected);
    assert!(h.peers.last_peer().is_closed());
    assert!(drain_logs(&mut logs)
        .iter()
        .any(|e| e.severity == Severity::Error && e.message.contains("connection reset")));
}
