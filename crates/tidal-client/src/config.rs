//! Viewer configuration: defaults, `TIDAL_*` environment overrides and validation.

use std::time::Duration;

use tidal_common::helpers::{env_bool, env_parse};
use tidal_common::{Error, Result, StreamConfig};
use tidal_quality::{ProfilePolicy, HISTORY_CAPACITY};

pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:3000/ws";

pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    /// Capture parameters sent to the host with every offer.
    pub stream: StreamConfig,
    /// Set when the capture source was chosen explicitly, so the host's
    /// source list does not override it.
    pub source_explicit: bool,
    pub telemetry_interval: Duration,
    pub history_capacity: usize,
    pub policy: ProfilePolicy,
    /// Reconnect with the new capture parameters when the quality profile changes.
    pub renegotiate_on_profile_change: bool,
    /// Start negotiating as soon as the host advertises its sources.
    pub auto_connect_on_sources: bool,
    /// Give up on an attempt that is still negotiating after this long.
    pub answer_timeout: Option<Duration>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            stream: StreamConfig::default(),
            source_explicit: false,
            telemetry_interval: Duration::from_secs(1),
            history_capacity: HISTORY_CAPACITY,
            policy: ProfilePolicy::default(),
            renegotiate_on_profile_change: false,
            auto_connect_on_sources: true,
            answer_timeout: None,
        }
    }
}

impl ViewerConfig {
    /// Defaults overlaid with `TIDAL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = env_parse::<String>("TIDAL_SIGNALING_URL")? {
            config.signaling_url = url;
        }
        if let Some(source) = env_parse::<String>("TIDAL_SOURCE")? {
            config.stream.source_type = source;
            config.source_explicit = true;
        }
        config.stream.enable_audio = env_bool("TIDAL_ENABLE_AUDIO", config.stream.enable_audio);
        config.stream.enable_microphone_input = env_bool(
            "TIDAL_ENABLE_MICROPHONE",
            config.stream.enable_microphone_input,
        );
        config.stream.use_hardware_encoding =
            env_bool("TIDAL_HW_ENCODING", config.stream.use_hardware_encoding);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_signaling_url(&self.signaling_url)?;
        if self.telemetry_interval.is_zero() {
            return Err(Error::config("telemetry interval must be non-zero"));
        }
        if self.history_capacity == 0 {
            return Err(Error::config("history capacity must be non-zero"));
        }
        if self.policy.min_bitrate_change_pct < 0.0 {
            return Err(Error::config("min_bitrate_change_pct must not be negative"));
        }
        self.stream.validate()
    }
}

fn is_production() -> bool {
    env_bool("TIDAL_ENVIRONMENT_PRODUCTION", false)
        || std::env::var("TIDAL_ENVIRONMENT")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false)
}

/// Accept `ws://` and `wss://` only; plain `ws://` is refused in production
/// unless `TIDAL_ALLOW_INSECURE_SIGNALING` is set.
pub fn validate_signaling_url(url: &str) -> Result<()> {
    check_signaling_url(
        url,
        is_production(),
        env_bool("TIDAL_ALLOW_INSECURE_SIGNALING", false),
    )
}

fn check_signaling_url(url: &str, production: bool, allow_insecure: bool) -> Result<()> {
    let lower = url.trim().to_ascii_lowercase();
    let insecure = lower.starts_with("ws://");
    if !insecure && !lower.starts_with("wss://") {
        return Err(Error::config(format!(
            "signaling URL must start with ws:// or wss://, got {url:?}"
        )));
    }
    if insecure && production && !allow_insecure {
        return Err(Error::config(
            "refusing insecure ws:// signaling URL in production; use wss:// or set TIDAL_ALLOW_INSECURE_SIGNALING=1",
        ));
    }
    Ok(())
}
