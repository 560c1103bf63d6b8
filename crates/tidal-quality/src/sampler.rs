//! Telemetry sampling: turns cumulative transport counters into rates.

use std::time::Instant;

use sysinfo::System;
use tidal_common::helpers::now_ms;
use tracing::debug;

use crate::metrics::MetricSample;

/// Inbound video counters from an `inbound-rtp` report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundVideoStats {
    pub frames_decoded: u64,
    pub bytes_received: u64,
    pub frames_dropped: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    /// Interarrival jitter in seconds.
    pub jitter_secs: f64,
    pub frame_width: u32,
    pub frame_height: u32,
}

/// Totals from the `transport` report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Statistics snapshot returned by the peer connection, one per poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsReport {
    pub inbound_video: Option<InboundVideoStats>,
    /// Round-trip time reported by `remote-inbound-rtp`, in seconds.
    pub round_trip_time_secs: Option<f64>,
    pub transport: Option<TransportStats>,
}

/// Host resource usage, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostLoad {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Source of host CPU and memory load.
pub trait HostProbe: Send {
    fn sample(&mut self) -> HostLoad;
}

/// Host probe backed by `sysinfo`.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between refreshes; prime the first one.
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for SysinfoProbe {
    fn sample(&mut self) -> HostLoad {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        let memory_percent = if total > 0 {
            self.system.used_memory() as f64 * 100.0 / total as f64
        } else {
            0.0
        };

        HostLoad {
            cpu_percent: f64::from(self.system.global_cpu_usage()).clamp(0.0, 100.0),
            memory_percent: memory_percent.clamp(0.0, 100.0),
        }
    }
}

/// Probe that always reports the same load. Used in tests and when host
/// monitoring is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedProbe(pub HostLoad);

impl HostProbe for FixedProbe {
    fn sample(&mut self) -> HostLoad {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    at: Instant,
    frames: u64,
    bytes: u64,
}

/// Derives per-second rates by differencing consecutive stats polls.
#[derive(Debug, Default)]
pub struct TelemetrySampler {
    prev: Option<Counters>,
    last_rtt_ms: f64,
}

impl TelemetrySampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget previous counters, e.g. when a new connection starts.
    pub fn reset(&mut self) {
        self.prev = None;
        self.last_rtt_ms = 0.0;
    }

    /// True once a previous poll exists, so the next sample carries rates.
    pub fn is_primed(&self) -> bool {
        self.prev.is_some()
    }

    /// Build a sample from a stats poll taken at `now`.
    ///
    /// The first poll after a reset yields zero rates. A zero time delta
    /// also yields zero rates.
    pub fn sample(&mut self, report: &StatsReport, host: HostLoad, now: Instant) -> MetricSample {
        if let Some(rtt) = report.round_trip_time_secs {
            self.last_rtt_ms = (rtt * 1000.0).max(0.0);
        }

        let mut sample = MetricSample {
            rtt_ms: self.last_rtt_ms,
            cpu_percent: host.cpu_percent,
            memory_percent: host.memory_percent,
            timestamp_ms: now_ms(),
            ..MetricSample::default()
        };

        let Some(video) = report.inbound_video.as_ref() else {
            return sample;
        };

        if let Some(prev) = self.prev {
            let dt = now.saturating_duration_since(prev.at).as_secs_f64();
            // Counters going backwards means the stream restarted.
            let frames = video.frames_decoded.saturating_sub(prev.frames);
            let bytes = video.bytes_received.saturating_sub(prev.bytes);
            sample.fps = rate(frames as f64, dt);
            sample.bitrate_kbps = rate(bytes as f64 * 8.0 / 1024.0, dt);
        }

        let total_packets = video.packets_received + video.packets_lost;
        sample.packet_loss_pct = if total_packets > 0 {
            video.packets_lost as f64 * 100.0 / total_packets as f64
        } else {
            0.0
        };
        sample.jitter_ms = video.jitter_secs * 1000.0;
        sample.frames_dropped = video.frames_dropped;
        sample.frame_width = video.frame_width;
        sample.frame_height = video.frame_height;

        self.prev = Some(Counters {
            at: now,
            frames: video.frames_decoded,
            bytes: video.bytes_received,
        });

        debug!(
            fps = format!("{:.1}", sample.fps),
            bitrate_kbps = format!("{:.0}", sample.bitrate_kbps),
            rtt_ms = format!("{:.0}", sample.rtt_ms),
            "telemetry sample"
        );
        sample
    }
}

fn rate(delta: f64, dt_secs: f64) -> f64 {
    if dt_secs > 0.0 {
        delta / dt_secs
    } else {
        0.0
    }
}
