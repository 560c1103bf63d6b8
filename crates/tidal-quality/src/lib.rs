//! Telemetry sampling, performance scoring and adaptive quality for Tidal.
//!
//! This crate provides:
//! - Rate derivation from cumulative transport counters ([`sampler`])
//! - Threshold classification, scoring and rolling history ([`evaluator`])
//! - Encoding profile selection and change gating ([`adaptive`])
//! - Throttled quality warnings for the status log ([`alerts`])

#![forbid(unsafe_code)]

pub mod adaptive;
pub mod alerts;
pub mod evaluator;
pub mod metrics;
pub mod sampler;

pub use adaptive::{compute_profile, ProfileGovernor, ProfilePolicy, QualityLabel, QualityProfile};
pub use alerts::{QualityAlert, WarningThrottle, WARNING_INTERVAL};
pub use evaluator::{
    Grade, GradeReport, Issue, IssueSeverity, MetricsExport, PerformanceEvaluator, Suggestion, Threshold,
    Thresholds,
};
pub use metrics::{Metric, MetricHistory, MetricSample, HISTORY_CAPACITY};
pub use sampler::{
    FixedProbe, HostLoad, HostProbe, InboundVideoStats, StatsReport, SysinfoProbe, TelemetrySampler,
    TransportStats,
};
