//! Metric samples and their bounded per-metric history.

use std::collections::VecDeque;

use serde::Serialize;

/// Samples kept per metric: one minute at the 1 Hz telemetry cadence.
pub const HISTORY_CAPACITY: usize = 60;

/// One telemetry observation, taken once per sampling tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricSample {
    pub fps: f64,
    pub bitrate_kbps: f64,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    /// Cumulative frames dropped by the receiver, as reported.
    pub frames_dropped: u64,
    pub packet_loss_pct: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Wall clock, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

/// Metrics tracked by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Fps,
    Bitrate,
    Latency,
    Cpu,
    Memory,
    DroppedFrames,
}

impl Metric {
    /// Metrics that get a rolling history.
    pub const HISTORY: [Metric; 5] = [
        Metric::Fps,
        Metric::Bitrate,
        Metric::Latency,
        Metric::Cpu,
        Metric::Memory,
    ];

    pub fn value(self, sample: &MetricSample) -> f64 {
        match self {
            Metric::Fps => sample.fps,
            Metric::Bitrate => sample.bitrate_kbps,
            Metric::Latency => sample.rtt_ms,
            Metric::Cpu => sample.cpu_percent,
            Metric::Memory => sample.memory_percent,
            Metric::DroppedFrames => sample.frames_dropped as f64,
        }
    }
}

/// Fixed-capacity ring of recent values, oldest first.
#[derive(Debug, Clone)]
pub struct MetricHistory {
    capacity: usize,
    values: VecDeque<f64>,
}

impl MetricHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            values: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }
}
