//! The peer-connection seam: what the negotiator needs from a media engine.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tidal_common::{Error, Result};
use tidal_quality::StatsReport;

use crate::candidates::Candidate;

/// Connection state as reported by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Asynchronous notifications raised by a peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A locally gathered candidate, ready for the wire.
    LocalCandidate(Candidate),
    StateChanged(PeerConnectionState),
    Track(TrackKind),
}

pub type PeerEventHandler = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// One receive-only peer connection. Always the offering side.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an offer to receive audio and video.
    async fn create_offer(&self) -> Result<String>;

    async fn set_local_description(&self, sdp: &str) -> Result<()>;

    /// Apply the host's answer.
    async fn set_remote_description(&self, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &str) -> Result<()>;

    async fn get_stats(&self) -> Result<StatsReport>;

    /// Attach local microphone capture to the connection.
    async fn enable_microphone(&self) -> Result<()> {
        Err(Error::device_denied("no microphone capture device available"))
    }

    async fn close(&self) -> Result<()>;
}

/// Creates a fresh [`PeerConnection`] for every connection attempt.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[String],
        events: PeerEventHandler,
    ) -> Result<Box<dyn PeerConnection>>;
}
