//! Structured, user-visible log events.
//!
//! These are the one-line status messages a presentation layer shows next to
//! the stream. They are mirrored into `tracing` when created through [`LogEvent::emit`].

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub time: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
}

impl LogEvent {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            severity,
            message: message.into(),
        }
    }

    /// Build the event and write it to `tracing` at the matching level.
    pub fn emit(severity: Severity, message: impl Into<String>) -> Self {
        let event = Self::new(severity, message);
        match event.severity {
            Severity::Debug => tracing::debug!(target: "tidal::status", "{}", event.message),
            Severity::Info | Severity::Success => {
                tracing::info!(target: "tidal::status", "{}", event.message)
            }
            Severity::Warning => tracing::warn!(target: "tidal::status", "{}", event.message),
            Severity::Error => tracing::error!(target: "tidal::status", "{}", event.message),
        }
        event
    }
}
