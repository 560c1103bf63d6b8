#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tidal_client::{
    MemoryConnector, NegotiationState, PeerConnection, PeerConnectionState, PeerEvent,
    PeerEventHandler, PeerFactory, Session, SessionHandle, ViewerConfig,
};
use tidal_common::{Error, LogEvent, Result, SignalMessage, StreamConfig};
use tidal_quality::{FixedProbe, HostLoad, InboundVideoStats, StatsReport};
use tokio::sync::broadcast;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerCall {
    CreateOffer,
    SetLocal(String),
    SetRemote(String),
    AddCandidate(String),
    GetStats,
    EnableMicrophone,
    Close,
}

/// Scripted peer connection that records every call made on it.
#[derive(Clone, Default)]
pub struct MockPeer {
    calls: Arc<Mutex<Vec<PeerCall>>>,
    polls: Arc<Mutex<u64>>,
    allow_microphone: bool,
}

impl MockPeer {
    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn added_candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PeerCall::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.calls().contains(&PeerCall::Close)
    }

    pub fn stats_polls(&self) -> u64 {
        *self.polls.lock().unwrap()
    }

    fn record(&self, call: PeerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> Result<String> {
        self.record(PeerCall::CreateOffer);
        Ok("v=0 mock-offer".into())
    }

    async fn set_local_description(&self, sdp: &str) -> Result<()> {
        self.record(PeerCall::SetLocal(sdp.into()));
        Ok(())
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<()> {
        self.record(PeerCall::SetRemote(sdp.into()));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        self.record(PeerCall::AddCandidate(candidate.into()));
        Ok(())
    }

    async fn get_stats(&self) -> Result<StatsReport> {
        self.record(PeerCall::GetStats);
        let mut polls = self.polls.lock().unwrap();
        *polls += 1;
        Ok(StatsReport {
            inbound_video: Some(InboundVideoStats {
                frames_decoded: *polls * 30,
                bytes_received: *polls * 256_000,
                packets_received: *polls * 100,
                frame_width: 1920,
                frame_height: 1080,
                ..InboundVideoStats::default()
            }),
            round_trip_time_secs: Some(0.030),
            transport: None,
        })
    }

    async fn enable_microphone(&self) -> Result<()> {
        self.record(PeerCall::EnableMicrophone);
        if self.allow_microphone {
            Ok(())
        } else {
            Err(Error::device_denied("microphone permission refused"))
        }
    }

    async fn close(&self) -> Result<()> {
        self.record(PeerCall::Close);
        Ok(())
    }
}

#[derive(Default)]
struct FactoryState {
    peers: Vec<MockPeer>,
    handlers: Vec<PeerEventHandler>,
    allow_microphone: bool,
}

/// Hands out [`MockPeer`]s and keeps their event handlers so tests can
/// raise peer events.
#[derive(Clone, Default)]
pub struct MockPeerFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl MockPeerFactory {
    pub fn allow_microphone(&self, allow: bool) {
        self.state.lock().unwrap().allow_microphone = allow;
    }

    pub fn created(&self) -> usize {
        self.state.lock().unwrap().peers.len()
    }

    pub fn peer(&self, index: usize) -> MockPeer {
        self.state.lock().unwrap().peers[index].clone()
    }

    pub fn last_peer(&self) -> MockPeer {
        self.state.lock().unwrap().peers.last().cloned().expect("no peer created")
    }

    /// Raise an event on the peer created `index`-th.
    pub fn emit_on(&self, index: usize, event: PeerEvent) {
        let handler = self.state.lock().unwrap().handlers[index].clone();
        handler(event);
    }

    pub fn emit(&self, event: PeerEvent) {
        let handler = self
            .state
            .lock()
            .unwrap()
            .handlers
            .last()
            .cloned()
            .expect("no peer created");
        handler(event);
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(
        &self,
        _ice_servers: &[String],
        events: PeerEventHandler,
    ) -> Result<Box<dyn PeerConnection>> {
        let mut state = self.state.lock().unwrap();
        let peer = MockPeer {
            allow_microphone: state.allow_microphone,
            ..MockPeer::default()
        };
        state.peers.push(peer.clone());
        state.handlers.push(events);
        Ok(Box::new(peer))
    }
}

pub struct Harness {
    pub handle: SessionHandle,
    pub peers: MockPeerFactory,
    pub host: MemoryConnector,
}

pub fn test_config() -> ViewerConfig {
    ViewerConfig {
        signaling_url: "ws://host.test/ws".into(),
        telemetry_interval: Duration::from_millis(10),
        auto_connect_on_sources: false,
        ..ViewerConfig::default()
    }
}

pub async fn start(config: ViewerConfig) -> Harness {
    start_with(config, MockPeerFactory::default(), MemoryConnector::new()).await
}

pub const IDLE_HOST: HostLoad = HostLoad {
    cpu_percent: 20.0,
    memory_percent: 40.0,
};

pub async fn start_with(
    config: ViewerConfig,
    peers: MockPeerFactory,
    host: MemoryConnector,
) -> Harness {
    launch(config, peers, host, IDLE_HOST).await
}

/// Start a session whose host reports `load` on every poll.
pub async fn start_loaded(config: ViewerConfig, load: HostLoad) -> Harness {
    launch(config, MockPeerFactory::default(), MemoryConnector::new(), load).await
}

async fn launch(
    config: ViewerConfig,
    peers: MockPeerFactory,
    host: MemoryConnector,
    load: HostLoad,
) -> Harness {
    init_tracing();
    let handle = Session::new(config, Arc::new(peers.clone()), Arc::new(host.clone()))
        .with_probe(FixedProbe(load))
        .spawn();
    handle.settle().await.unwrap();
    Harness {
        handle,
        peers,
        host,
    }
}

impl Harness {
    /// Deliver a host message and wait until the session has handled it.
    pub async fn host_says(&self, message: SignalMessage) {
        assert!(self.host.deliver(&message), "signaling channel not open");
        self.handle.settle().await.unwrap();
    }

    pub async fn peer_says(&self, event: PeerEvent) {
        self.peers.emit(event);
        self.handle.settle().await.unwrap();
    }

    pub fn sent_candidates(&self) -> Vec<String> {
        self.host
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                SignalMessage::IceCandidate { candidate } => Some(candidate),
                _ => None,
            })
            .collect()
    }

    pub fn offers(&self) -> Vec<SignalMessage> {
        self.host
            .sent()
            .into_iter()
            .filter(|m| matches!(m, SignalMessage::Offer { .. }))
            .collect()
    }

    /// Poll the session until `done` holds or five seconds pass.
    pub async fn wait_until(&self, what: &str, done: impl Fn(&Harness) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                self.handle.settle().await.unwrap();
                if done(self) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    /// Answer the pending offer and report the peer as connected.
    pub async fn establish(&self) {
        self.host_says(SignalMessage::Answer {
            sdp: "v=0 mock-answer".into(),
        })
        .await;
        self.peer_says(PeerEvent::StateChanged(PeerConnectionState::Connected))
            .await;
        assert_eq!(self.handle.current_state(), NegotiationState::Connected);
    }

    pub fn offered_streams(&self) -> Vec<StreamConfig> {
        self.offers()
            .into_iter()
            .filter_map(|m| match m {
                SignalMessage::Offer { config, .. } => Some(config),
                _ => None,
            })
            .collect()
    }

    pub async fn wait_for_state(&self, target: NegotiationState) {
        let mut state = self.handle.state();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *state.borrow_and_update() != target {
                state.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("state never reached {target:?}"));
    }
}

pub fn drain_logs(rx: &mut broadcast::Receiver<LogEvent>) -> Vec<LogEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
