//! Adaptive quality: target encoding profile selection and change gating.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::metrics::MetricSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLabel {
    Low,
    Medium,
    High,
}

/// Target encoding parameters for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QualityProfile {
    pub resolution: (u32, u32),
    pub framerate_fps: u32,
    pub bitrate_kbps: u32,
    pub label: QualityLabel,
}

impl QualityProfile {
    pub const HIGH: QualityProfile = QualityProfile {
        resolution: (1920, 1080),
        framerate_fps: 30,
        bitrate_kbps: 5000,
        label: QualityLabel::High,
    };

    pub const MEDIUM: QualityProfile = QualityProfile {
        resolution: (1280, 720),
        framerate_fps: 24,
        bitrate_kbps: 3000,
        label: QualityLabel::Medium,
    };

    pub const LOW: QualityProfile = QualityProfile {
        resolution: (854, 480),
        framerate_fps: 20,
        bitrate_kbps: 1500,
        label: QualityLabel::Low,
    };
}

impl QualityProfile {
    /// Clamp resolution and framerate to what the operator configured.
    ///
    /// Each dimension is capped on its own; bitrate and label are kept.
    pub fn capped(self, resolution: (u32, u32), framerate_fps: u32) -> Self {
        Self {
            resolution: (
                self.resolution.0.min(resolution.0),
                self.resolution.1.min(resolution.1),
            ),
            framerate_fps: self.framerate_fps.min(framerate_fps),
            ..self
        }
    }
}

/// Framerate floor for the latency penalty.
const LATENCY_MIN_FPS: u32 = 15;
/// Bitrate floor for the latency penalty, in kbps.
const LATENCY_MIN_BITRATE_KBPS: u32 = 1000;

/// Pick the encoding profile for the current metrics.
///
/// Pure function of one sample; history is not consulted.
pub fn compute_profile(metrics: &MetricSample) -> QualityProfile {
    let mut profile = QualityProfile::HIGH;

    if metrics.fps < 20.0 || metrics.cpu_percent > 80.0 {
        profile = QualityProfile::MEDIUM;
    }

    // Replaces the medium step outright.
    if metrics.fps < 15.0 || metrics.cpu_percent > 90.0 {
        profile = QualityProfile::LOW;
    }

    if metrics.rtt_ms > 200.0 {
        profile.framerate_fps = profile
            .framerate_fps
            .saturating_sub(5)
            .max(LATENCY_MIN_FPS);
        profile.bitrate_kbps = (profile.bitrate_kbps * 4 / 5).max(LATENCY_MIN_BITRATE_KBPS);
    }

    profile
}

/// Rules for when a freshly computed profile replaces the active one.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfilePolicy {
    /// Minimum time between two applied changes. Zero disables dwell gating.
    pub min_dwell: Duration,
    /// Bitrate-only changes smaller than this (percent of the active
    /// bitrate) are ignored.
    pub min_bitrate_change_pct: f64,
}

impl Default for ProfilePolicy {
    fn default() -> Self {
        Self {
            min_dwell: Duration::ZERO,
            min_bitrate_change_pct: 10.0,
        }
    }
}

impl ProfilePolicy {
    pub fn differs_meaningfully(&self, active: &QualityProfile, candidate: &QualityProfile) -> bool {
        if active.label != candidate.label
            || active.resolution != candidate.resolution
            || active.framerate_fps != candidate.framerate_fps
        {
            return true;
        }
        if active.bitrate_kbps == 0 {
            return candidate.bitrate_kbps != 0;
        }
        let delta = (candidate.bitrate_kbps as f64 - active.bitrate_kbps as f64).abs();
        delta * 100.0 / active.bitrate_kbps as f64 > self.min_bitrate_change_pct
    }
}

/// Tracks the active profile and gates changes through a [`ProfilePolicy`].
pub struct ProfileGovernor {
    policy: ProfilePolicy,
    active: QualityProfile,
    last_change: Option<Instant>,
}

impl ProfileGovernor {
    pub fn new(policy: ProfilePolicy, initial: QualityProfile) -> Self {
        Self {
            policy,
            active: initial,
            last_change: None,
        }
    }

    pub fn active(&self) -> QualityProfile {
        self.active
    }

    /// Returns the new profile when `candidate` should be applied.
    pub fn consider(&mut self, candidate: QualityProfile, now: Instant) -> Option<QualityProfile> {
        if !self.policy.differs_meaningfully(&self.active, &candidate) {
            return None;
        }

        if let Some(last) = self.last_change {
            let dwell = now.saturating_duration_since(last);
            if dwell < self.policy.min_dwell {
                debug!(
                    "profile change to {:?} held back ({:?} < {:?} dwell)",
                    candidate.label, dwell, self.policy.min_dwell
                );
                return None;
            }
        }

        info!(
            "quality profile {:?} {}x{}@{} {}kbps -> {:?} {}x{}@{} {}kbps",
            self.active.label,
            self.active.resolution.0,
            self.active.resolution.1,
            self.active.framerate_fps,
            self.active.bitrate_kbps,
            candidate.label,
            candidate.resolution.0,
            candidate.resolution.1,
            candidate.framerate_fps,
            candidate.bitrate_kbps
        );
        self.active = candidate;
        self.last_change = Some(now);
        Some(candidate)
    }
}
