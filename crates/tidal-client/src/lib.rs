//! Tidal viewer client: negotiates a receive-only WebRTC session with a
//! streaming host and keeps its quality in check.

#![forbid(unsafe_code)]

pub mod candidates;
pub mod config;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod webrtc_peer;

pub use candidates::{Candidate, CandidateQueue};
pub use config::ViewerConfig;
pub use negotiation::{NegotiationSession, NegotiationState, Negotiator, Transition};
pub use peer::{PeerConnection, PeerConnectionState, PeerEvent, PeerEventHandler, PeerFactory, TrackKind};
pub use session::{HostInventory, Session, SessionHandle};
pub use signaling::{
    ChannelConnector, ChannelEvent, ChannelHandler, MemoryConnector, SignalingChannel,
    WebSocketConnector,
};
pub use webrtc_peer::WebRtcPeerFactory;
