//! Offer/answer negotiation and candidate sequencing for one viewer.

use serde::Serialize;
use tidal_common::{Error, Result, SignalMessage, StreamConfig};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::candidates::{Candidate, CandidateQueue};
use crate::peer::{PeerConnection, PeerConnectionState};
use crate::signaling::SignalingChannel;

/// Viewer-level negotiation state.
///
/// ```text
/// Idle -> Negotiating -> Connected -> {Disconnected, Failed, Closed}
/// ```
///
/// The three terminal states hold no resources; `connect()` starts a new
/// attempt from any of them and `disconnect()` returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationState {
    Idle,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Negotiating | Self::Connected)
    }
}

/// What a peer state change means for the viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    None,
    Connected,
    Failed(String),
    Closed,
}

/// Per-attempt negotiation state. Never reused across attempts.
pub struct NegotiationSession {
    id: Uuid,
    attempt: u64,
    peer: Box<dyn PeerConnection>,
    local_description_set: bool,
    remote_description_set: bool,
    connection_state: PeerConnectionState,
    /// Local candidates waiting for the answer.
    outbound: CandidateQueue,
    /// Remote candidates that arrived before the answer was applied.
    inbound: CandidateQueue,
}

impl NegotiationSession {
    fn new(peer: Box<dyn PeerConnection>, attempt: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempt,
            peer,
            local_description_set: false,
            remote_description_set: false,
            connection_state: PeerConnectionState::New,
            outbound: CandidateQueue::new(),
            inbound: CandidateQueue::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn local_description_set(&self) -> bool {
        self.local_description_set
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.connection_state
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    async fn apply_remote(&self, candidate: &str) {
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            warn!("session {}: failed to add remote candidate: {}", self.id, e);
        }
    }
}

/// Owns the active [`NegotiationSession`] and the viewer state.
pub struct Negotiator {
    state: NegotiationState,
    session: Option<NegotiationSession>,
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl Negotiator {
    pub fn new() -> Self {
        Self {
            state: NegotiationState::Idle,
            session: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn session(&self) -> Option<&NegotiationSession> {
        self.session.as_ref()
    }

    pub fn peer(&self) -> Option<&dyn PeerConnection> {
        self.session.as_ref().map(|s| s.peer.as_ref())
    }

    /// True when `attempt` is the live attempt.
    pub fn is_current(&self, attempt: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.attempt == attempt)
    }

    /// Begin a new attempt on `peer`: create the offer, install it locally
    /// and send it with `config`.
    ///
    /// Any existing session is torn down first. On failure the new session
    /// is torn down as well and the state returns to `Idle`.
    pub async fn start(
        &mut self,
        peer: Box<dyn PeerConnection>,
        attempt: u64,
        config: &StreamConfig,
        channel: &dyn SignalingChannel,
    ) -> Result<()> {
        self.teardown().await;

        let session = NegotiationSession::new(peer, attempt);
        info!("session {}: negotiating (attempt {})", session.id, attempt);
        self.session = Some(session);
        self.state = NegotiationState::Negotiating;

        if let Err(e) = self.send_offer(config, channel).await {
            self.teardown().await;
            self.state = NegotiationState::Idle;
            return Err(e);
        }
        Ok(())
    }

    async fn send_offer(&mut self, config: &StreamConfig, channel: &dyn SignalingChannel) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::internal("no negotiation session"))?;

        let sdp = session.peer.create_offer().await?;
        session.peer.set_local_description(&sdp).await?;
        session.local_description_set = true;

        channel.send(&SignalMessage::Offer {
            sdp,
            config: config.clone(),
        })?;
        debug!("session {}: offer sent", session.id);
        Ok(())
    }

    /// Apply the host's answer, then release everything that was waiting
    /// on it: buffered remote candidates first, then queued local ones.
    pub async fn handle_answer(&mut self, sdp: &str, channel: &dyn SignalingChannel) -> Result<()> {
        let state = self.state;
        let Some(session) = self.session.as_mut() else {
            warn!("ignoring answer: no negotiation in progress");
            return Ok(());
        };
        if state != NegotiationState::Negotiating || session.remote_description_set {
            warn!("session {}: ignoring unexpected answer in {:?}", session.id, state);
            return Ok(());
        }

        session.peer.set_remote_description(sdp).await?;
        session.remote_description_set = true;
        info!("session {}: remote description applied", session.id);

        for candidate in session.inbound.drain() {
            session.apply_remote(&candidate).await;
        }

        let queued = session.outbound.drain();
        if !queued.is_empty() {
            debug!(
                "session {}: flushing {} queued local candidates",
                session.id,
                queued.len()
            );
        }
        for candidate in queued {
            channel.send(&SignalMessage::IceCandidate { candidate })?;
        }
        Ok(())
    }

    /// Remote candidates are applied in receipt order, each exactly once.
    /// Ones that arrive before the answer wait for it.
    pub async fn handle_remote_candidate(&mut self, candidate: Candidate) {
        let Some(session) = self.session.as_mut() else {
            debug!("ignoring remote candidate: no negotiation in progress");
            return;
        };
        if session.remote_description_set {
            session.apply_remote(&candidate).await;
        } else {
            session.inbound.push(candidate);
        }
    }

    /// Local candidates are held back until the answer has been applied.
    pub fn handle_local_candidate(
        &mut self,
        candidate: Candidate,
        channel: &dyn SignalingChannel,
    ) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if session.remote_description_set {
            channel.send(&SignalMessage::IceCandidate { candidate })
        } else {
            session.outbound.push(candidate);
            Ok(())
        }
    }

    pub fn handle_peer_state(&mut self, state: PeerConnectionState) -> Transition {
        let Some(session) = self.session.as_mut() else {
            return Transition::None;
        };
        session.connection_state = state;

        match state {
            PeerConnectionState::New | PeerConnectionState::Connecting => Transition::None,
            PeerConnectionState::Connected => {
                if self.state == NegotiationState::Connected {
                    return Transition::None;
                }
                self.state = NegotiationState::Connected;
                Transition::Connected
            }
            PeerConnectionState::Disconnected => {
                Transition::Failed("peer connection disconnected".into())
            }
            PeerConnectionState::Failed => Transition::Failed("peer connection failed".into()),
            PeerConnectionState::Closed => Transition::Closed,
        }
    }

    /// Set a terminal or idle state after teardown.
    pub fn set_state(&mut self, state: NegotiationState) {
        self.state = state;
    }

    /// Release the active session, if any. Safe to call repeatedly.
    pub async fn teardown(&mut self) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };
        session.outbound.clear();
        session.inbound.clear();
        if let Err(e) = session.peer.close().await {
            warn!("session {}: error closing peer connection: {}", session.id, e);
        }
        debug!("session {}: torn down", session.id);
        true
    }
}
