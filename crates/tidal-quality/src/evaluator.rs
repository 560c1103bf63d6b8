//! Performance evaluation: threshold classification, scoring and history.

use std::collections::BTreeMap;

use serde::Serialize;
use tidal_common::helpers::now_ms;

use crate::metrics::{Metric, MetricHistory, MetricSample, HISTORY_CAPACITY};

/// Which side of a threshold is bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LowerIsWorse,
    HigherIsWorse,
}

/// Two-tier bound for one metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
    pub direction: Direction,
}

impl Threshold {
    pub const fn lower_is_worse(warning: f64, critical: f64) -> Self {
        Self {
            warning,
            critical,
            direction: Direction::LowerIsWorse,
        }
    }

    pub const fn higher_is_worse(warning: f64, critical: f64) -> Self {
        Self {
            warning,
            critical,
            direction: Direction::HigherIsWorse,
        }
    }

    /// Critical supersedes warning; bounds themselves are not breaches.
    pub fn classify(&self, value: f64) -> Option<IssueSeverity> {
        let (critical, warning) = match self.direction {
            Direction::LowerIsWorse => (value < self.critical, value < self.warning),
            Direction::HigherIsWorse => (value > self.critical, value > self.warning),
        };
        if critical {
            Some(IssueSeverity::Critical)
        } else if warning {
            Some(IssueSeverity::Warning)
        } else {
            None
        }
    }
}

/// Threshold table for the monitored metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub fps: Threshold,
    pub latency_ms: Threshold,
    pub cpu_percent: Threshold,
    pub memory_percent: Threshold,
    pub dropped_frames: Threshold,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            fps: Threshold::lower_is_worse(25.0, 15.0),
            latency_ms: Threshold::higher_is_worse(100.0, 200.0),
            cpu_percent: Threshold::higher_is_worse(70.0, 90.0),
            memory_percent: Threshold::higher_is_worse(80.0, 95.0),
            dropped_frames: Threshold::higher_is_worse(5.0, 10.0),
        }
    }
}

/// Issue text for one monitored metric: `(label, suggestion)` per tier.
struct IssueWording {
    warning: (&'static str, &'static str),
    critical: (&'static str, &'static str),
    unit: &'static str,
}

const FPS_WORDING: IssueWording = IssueWording {
    warning: ("Low FPS", "Consider lowering the resolution or frame rate"),
    critical: ("Critical FPS", "Reduce video quality or close other applications"),
    unit: "",
};

const LATENCY_WORDING: IssueWording = IssueWording {
    warning: ("Elevated latency", "Consider using a wired connection"),
    critical: ("High latency", "Check your network connection"),
    unit: "ms",
};

const CPU_WORDING: IssueWording = IssueWording {
    warning: ("High CPU usage", "Consider lowering the frame rate"),
    critical: (
        "Critical CPU usage",
        "Close background processes or lower the stream settings",
    ),
    unit: "%",
};

const MEMORY_WORDING: IssueWording = IssueWording {
    warning: ("High memory usage", "Keep an eye on memory usage"),
    critical: ("Critical memory usage", "Close other applications"),
    unit: "%",
};

const DROPPED_WORDING: IssueWording = IssueWording {
    warning: ("Dropped frames", "Monitor decoder performance"),
    critical: ("Many dropped frames", "Lower the bitrate to relieve the decoder"),
    unit: "",
};

impl Thresholds {
    fn monitored(&self) -> [(Metric, Threshold, &'static IssueWording); 5] {
        [
            (Metric::Fps, self.fps, &FPS_WORDING),
            (Metric::Latency, self.latency_ms, &LATENCY_WORDING),
            (Metric::Cpu, self.cpu_percent, &CPU_WORDING),
            (Metric::Memory, self.memory_percent, &MEMORY_WORDING),
            (Metric::DroppedFrames, self.dropped_frames, &DROPPED_WORDING),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Warning,
    Critical,
}

/// A threshold breach found on the current tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub severity: IssueSeverity,
    pub metric: Metric,
    pub message: String,
    pub suggestion: String,
}

/// Advisory optimization hint derived from raw metric values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suggestion {
    pub category: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub impact: &'static str,
    pub difficulty: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    /// Lower bounds are inclusive.
    pub fn from_score(score: u32) -> Self {
        match score {
            90.. => Grade::A,
            80..=89 => Grade::B,
            70..=79 => Grade::C,
            60..=69 => Grade::D,
            _ => Grade::F,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Grade::A => "Excellent",
            Grade::B => "Good",
            Grade::C => "Fair",
            Grade::D => "Poor",
            Grade::F => "Critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GradeReport {
    pub grade: Grade,
    pub description: &'static str,
}

impl From<Grade> for GradeReport {
    fn from(grade: Grade) -> Self {
        Self {
            grade,
            description: grade.description(),
        }
    }
}

/// Snapshot handed to presentation layers after every evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsExport {
    pub timestamp: u64,
    pub metrics: MetricSample,
    pub history: BTreeMap<Metric, Vec<f64>>,
    pub issues: Vec<Issue>,
    pub suggestions: Vec<Suggestion>,
    pub score: u32,
    pub grade: GradeReport,
}

/// Classifies samples, keeps per-metric history and scores the session.
pub struct PerformanceEvaluator {
    thresholds: Thresholds,
    history: BTreeMap<Metric, MetricHistory>,
}

impl Default for PerformanceEvaluator {
    fn default() -> Self {
        Self::new(Thresholds::default(), HISTORY_CAPACITY)
    }
}

impl PerformanceEvaluator {
    pub fn new(thresholds: Thresholds, history_capacity: usize) -> Self {
        let history = Metric::HISTORY
            .iter()
            .map(|m| (*m, MetricHistory::new(history_capacity)))
            .collect();
        Self {
            thresholds,
            history,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn history(&self, metric: Metric) -> Option<&MetricHistory> {
        self.history.get(&metric)
    }

    /// Drop all history, e.g. between connection attempts.
    pub fn reset(&mut self) {
        for history in self.history.values_mut() {
            *history = MetricHistory::new(history.capacity());
        }
    }

    /// Record `sample` and produce the evaluation for this tick.
    pub fn evaluate(&mut self, sample: MetricSample) -> MetricsExport {
        for (metric, history) in self.history.iter_mut() {
            history.push(metric.value(&sample));
        }

        let issues = self.classify(&sample);
        let suggestions = suggestions(&sample);
        let score = score(&sample);

        MetricsExport {
            timestamp: now_ms(),
            history: self
                .history
                .iter()
                .map(|(metric, history)| (*metric, history.to_vec()))
                .collect(),
            issues,
            suggestions,
            score,
            grade: Grade::from_score(score).into(),
            metrics: sample,
        }
    }

    /// At most one issue per metric.
    pub fn classify(&self, sample: &MetricSample) -> Vec<Issue> {
        self.thresholds
            .monitored()
            .into_iter()
            .filter_map(|(metric, threshold, wording)| {
                let value = metric.value(sample);
                threshold
                    .classify(value)
                    .map(|severity| issue(metric, wording, severity, value))
            })
            .collect()
    }
}

fn issue(metric: Metric, wording: &IssueWording, severity: IssueSeverity, value: f64) -> Issue {
    let (label, suggestion) = match severity {
        IssueSeverity::Critical => wording.critical,
        IssueSeverity::Warning => wording.warning,
    };
    Issue {
        severity,
        metric,
        message: format!("{label}: {value:.0}{}", wording.unit),
        suggestion: suggestion.to_string(),
    }
}

/// Fixed deductions per breached tier, additive across metrics.
pub fn score(sample: &MetricSample) -> u32 {
    let mut score: i32 = 100;

    if sample.fps < 30.0 {
        score -= 20;
    }
    if sample.fps < 15.0 {
        score -= 30;
    }

    if sample.rtt_ms > 100.0 {
        score -= 15;
    }
    if sample.rtt_ms > 200.0 {
        score -= 25;
    }

    if sample.memory_percent > 80.0 {
        score -= 10;
    }
    if sample.memory_percent > 95.0 {
        score -= 20;
    }

    if sample.frames_dropped > 5 {
        score -= 10;
    }
    if sample.frames_dropped > 10 {
        score -= 20;
    }

    score.clamp(0, 100) as u32
}

pub fn suggestions(sample: &MetricSample) -> Vec<Suggestion> {
    let mut out = Vec::new();

    if sample.fps < 30.0 {
        out.push(Suggestion {
            category: "video",
            title: "Reduce video quality",
            description: "Lower the resolution or frame rate to improve performance",
            impact: "high",
            difficulty: "easy",
        });
    }

    if sample.rtt_ms > 50.0 {
        out.push(Suggestion {
            category: "network",
            title: "Optimize network connection",
            description: "Use a wired connection or improve Wi-Fi quality",
            impact: "high",
            difficulty: "medium",
        });
    }

    if sample.memory_percent > 70.0 {
        out.push(Suggestion {
            category: "system",
            title: "Free memory",
            description: "Close unneeded applications to free RAM",
            impact: "medium",
            difficulty: "easy",
        });
    }

    if sample.cpu_percent > 80.0 {
        out.push(Suggestion {
            category: "system",
            title: "Reduce CPU load",
            description: "Close background processes or reduce settings",
            impact: "high",
            difficulty: "medium",
        });
    }

    out
}
