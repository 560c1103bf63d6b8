//! [`PeerConnection`] backed by webrtc-rs.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tidal_common::{Error, Result};
use tidal_quality::{InboundVideoStats, StatsReport, TransportStats};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::stats::StatsReportType;

use crate::peer::{PeerConnection, PeerConnectionState, PeerEvent, PeerEventHandler, PeerFactory, TrackKind};

/// Builds receive-only peer connections with the default codec set.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcPeerFactory;

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[String],
        events: PeerEventHandler,
    ) -> Result<Box<dyn PeerConnection>> {
        let mut m = MediaEngine::default();
        m.register_default_codecs().map_err(Error::peer)?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m).map_err(Error::peer)?;
        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(Error::peer)?);

        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(Error::peer)?;
        }

        let video = Arc::new(Mutex::new(ReceiveCounters::default()));
        wire_callbacks(&pc, events, Arc::clone(&video));

        Ok(Box::new(WebRtcPeer { pc, video }))
    }
}

fn wire_callbacks(
    pc: &Arc<RTCPeerConnection>,
    events: PeerEventHandler,
    video: Arc<Mutex<ReceiveCounters>>,
) {
    let candidate_events = Arc::clone(&events);
    pc.on_ice_candidate(Box::new(move |c| {
        let events = Arc::clone(&candidate_events);
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(candidate) = c else { return };
            match candidate
                .to_json()
                .map_err(Error::peer)
                .and_then(|init| serde_json::to_string(&init).map_err(Error::serialization))
            {
                Ok(json) => events(PeerEvent::LocalCandidate(json)),
                Err(e) => warn!("dropping local candidate: {}", e),
            }
        })
    }));

    let state_events = Arc::clone(&events);
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let events = Arc::clone(&state_events);
        Box::pin(async move {
            debug!("peer connection state: {}", s);
            if let Some(state) = map_state(s) {
                events(PeerEvent::StateChanged(state));
            }
        })
    }));

    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let events = Arc::clone(&events);
        let video = Arc::clone(&video);
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                _ => return,
            };
            info!("remote {:?} track: {}", kind, track.codec().capability.mime_type);
            events(PeerEvent::Track(kind));

            let is_video = kind == TrackKind::Video;
            let vp8 = track
                .codec()
                .capability
                .mime_type
                .eq_ignore_ascii_case(MIME_TYPE_VP8);
            tokio::spawn(async move {
                while let Ok((packet, _)) = track.read_rtp().await {
                    if !is_video {
                        continue;
                    }
                    let mut counters = video.lock().unwrap_or_else(|e| e.into_inner());
                    counters.on_packet(
                        packet.header.sequence_number,
                        packet.header.marker,
                        Instant::now(),
                    );
                    if vp8 {
                        if let Some(size) = vp8_keyframe_dimensions(&packet.payload) {
                            counters.frame_size = Some(size);
                        }
                    }
                }
                debug!("remote {:?} track ended", kind);
            });
        })
    }));
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        _ => None,
    }
}

/// Frame size from the first packet of a VP8 keyframe (RFC 7741 payload
/// descriptor followed by the RFC 6386 frame header).
///
/// Returns `None` for interframes, continuation packets and partitions
/// other than the first.
fn vp8_keyframe_dimensions(payload: &[u8]) -> Option<(u32, u32)> {
    let first = *payload.first()?;
    let extended = first & 0x80 != 0;
    let start_of_partition = first & 0x10 != 0;
    if !start_of_partition || first & 0x07 != 0 {
        return None;
    }

    let mut offset = 1;
    if extended {
        let ext = *payload.get(offset)?;
        offset += 1;
        if ext & 0x80 != 0 {
            // 15-bit picture id when the M bit is set.
            let picture_id = *payload.get(offset)?;
            offset += if picture_id & 0x80 != 0 { 2 } else { 1 };
        }
        if ext & 0x40 != 0 {
            offset += 1;
        }
        if ext & 0x30 != 0 {
            offset += 1;
        }
    }

    let frame = payload.get(offset..)?;
    if frame.len() < 10 || frame[0] & 0x01 != 0 || frame[3..6] != [0x9d, 0x01, 0x2a] {
        return None;
    }
    let width = u16::from_le_bytes([frame[6], frame[7]]) & 0x3fff;
    let height = u16::from_le_bytes([frame[8], frame[9]]) & 0x3fff;
    Some((u32::from(width), u32::from(height)))
}

/// Frame-level receive counters for one video track.
///
/// The engine's inbound stats carry bytes and packets only, so complete
/// frames are counted here: an RTP packet with the marker bit set ends a
/// frame, and a frame that spanned a sequence gap counts as dropped.
/// Frame size is only known for VP8, read from keyframe headers.
#[derive(Debug, Default)]
struct ReceiveCounters {
    frames: u64,
    dropped: u64,
    packets: u64,
    lost: u64,
    last_seq: Option<u16>,
    frame_damaged: bool,
    last_frame_at: Option<Instant>,
    interval_avg_us: f64,
    jitter_us: f64,
    frame_size: Option<(u32, u32)>,
}

impl ReceiveCounters {
    fn on_packet(&mut self, seq: u16, marker: bool, now: Instant) {
        self.packets += 1;
        if let Some(last) = self.last_seq {
            let gap = seq.wrapping_sub(last);
            // Large forward jumps are reordering or a restart, not loss.
            if gap > 1 && gap < 0x8000 {
                self.lost += u64::from(gap - 1);
                self.frame_damaged = true;
            }
        }
        self.last_seq = Some(seq);

        if marker {
            if self.frame_damaged {
                self.dropped += 1;
            } else {
                self.frames += 1;
            }
            self.frame_damaged = false;
            self.on_frame(now);
        }
    }

    fn on_frame(&mut self, now: Instant) {
        if let Some(last) = self.last_frame_at {
            let interval = now.saturating_duration_since(last).as_micros() as f64;
            if self.interval_avg_us == 0.0 {
                self.interval_avg_us = interval;
            } else {
                self.interval_avg_us += (interval - self.interval_avg_us) / 16.0;
            }
            let deviation = (interval - self.interval_avg_us).abs();
            self.jitter_us += (deviation - self.jitter_us) / 16.0;
        }
        self.last_frame_at = Some(now);
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    video: Arc<Mutex<ReceiveCounters>>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await.map_err(Error::peer)?;
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, sdp: &str) -> Result<()> {
        let desc = RTCSessionDescription::offer(sdp.to_owned()).map_err(Error::peer)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(Error::peer)
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<()> {
        let desc = RTCSessionDescription::answer(sdp.to_owned()).map_err(Error::peer)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(Error::negotiation)
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        let init: RTCIceCandidateInit =
            serde_json::from_str(candidate).map_err(Error::malformed)?;
        self.pc.add_ice_candidate(init).await.map_err(Error::peer)
    }

    async fn get_stats(&self) -> Result<StatsReport> {
        let stats = self.pc.get_stats().await;
        let mut report = StatsReport::default();

        for stat in stats.reports.values() {
            match stat {
                StatsReportType::InboundRTP(inbound) if inbound.kind == "video" => {
                    let video = report
                        .inbound_video
                        .get_or_insert_with(InboundVideoStats::default);
                    video.bytes_received += inbound.bytes_received as u64;
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    if let Some(rtt) = remote.round_trip_time {
                        report.round_trip_time_secs = Some(rtt);
                    }
                }
                StatsReportType::Transport(transport) => {
                    report.transport = Some(TransportStats {
                        bytes_sent: transport.bytes_sent as u64,
                        bytes_received: transport.bytes_received as u64,
                    });
                }
                _ => {}
            }
        }

        if let Some(video) = report.inbound_video.as_mut() {
            let counters = self.video.lock().unwrap_or_else(|e| e.into_inner());
            video.frames_decoded = counters.frames;
            video.frames_dropped = counters.dropped;
            video.packets_received = counters.packets;
            video.packets_lost = counters.lost;
            video.jitter_secs = counters.jitter_us / 1_000_000.0;
            if let Some((width, height)) = counters.frame_size {
                video.frame_width = width;
                video.frame_height = height;
            }
        }

        Ok(report)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(Error::peer)
    }
}
