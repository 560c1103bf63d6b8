//! Rate-limited quality warnings for the status log.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::metrics::MetricSample;

/// Minimum gap between two warnings of the same kind.
pub const WARNING_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QualityAlert {
    LowFramerate(f64),
    LowBitrate(f64),
    PacketLoss(f64),
    LowResolution(u32, u32),
}

impl QualityAlert {
    fn kind(&self) -> AlertKind {
        match self {
            Self::LowFramerate(_) => AlertKind::Framerate,
            Self::LowBitrate(_) => AlertKind::Bitrate,
            Self::PacketLoss(_) => AlertKind::Loss,
            Self::LowResolution(..) => AlertKind::Resolution,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::LowFramerate(fps) => format!("Low framerate detected: {fps:.1} fps"),
            Self::LowBitrate(kbps) => format!("Low bitrate detected: {kbps:.0} kbps"),
            Self::PacketLoss(pct) => format!("High packet loss: {pct:.1}%"),
            Self::LowResolution(w, h) => format!("Low resolution: {w}x{h}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AlertKind {
    Framerate,
    Bitrate,
    Loss,
    Resolution,
}

/// Emits each kind of quality warning at most once per [`WARNING_INTERVAL`].
///
/// Zero readings mean "no data yet" and never alert.
#[derive(Debug, Default)]
pub struct WarningThrottle {
    last: HashMap<AlertKind, Instant>,
}

impl WarningThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.last.clear();
    }

    /// Alerts due for `sample` at `now`, marking them as emitted.
    pub fn check(&mut self, sample: &MetricSample, now: Instant) -> Vec<QualityAlert> {
        let mut candidates = Vec::new();
        if sample.fps > 0.0 && sample.fps < 15.0 {
            candidates.push(QualityAlert::LowFramerate(sample.fps));
        }
        if sample.bitrate_kbps > 0.0 && sample.bitrate_kbps < 500.0 {
            candidates.push(QualityAlert::LowBitrate(sample.bitrate_kbps));
        }
        if sample.packet_loss_pct > 5.0 {
            candidates.push(QualityAlert::PacketLoss(sample.packet_loss_pct));
        }
        if sample.frame_width > 0 && (sample.frame_width < 1280 || sample.frame_height < 720) {
            candidates.push(QualityAlert::LowResolution(
                sample.frame_width,
                sample.frame_height,
            ));
        }

        candidates.retain(|alert| {
            let kind = alert.kind();
            match self.last.get(&kind) {
                Some(at) if now.saturating_duration_since(*at) < WARNING_INTERVAL => false,
                _ => {
                    self.last.insert(kind, now);
                    true
                }
            }
        });
        candidates
    }
}
