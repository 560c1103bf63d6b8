//! Common error types for Tidal.

use thiserror::Error;

/// Result type alias using Tidal's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Tidal operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Signaling transport is not open
    #[error("signaling channel closed")]
    ChannelClosed,

    /// Inbound signaling payload could not be parsed
    #[error("malformed signaling message: {0}")]
    MalformedMessage(String),

    /// The peer connection reported failure or could not be negotiated
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// A capture capability (e.g. microphone) was refused
    #[error("device access denied: {0}")]
    DeviceAccessDenied(String),

    /// A requested capability is not available on this viewer
    #[error("unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error on the outbound path
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Error reported by the underlying peer-connection engine
    #[error("peer connection error: {0}")]
    Peer(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a malformed-message error from any displayable type.
    pub fn malformed(msg: impl std::fmt::Display) -> Self {
        Self::MalformedMessage(msg.to_string())
    }

    /// Create a negotiation error from any displayable type.
    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::NegotiationFailed(msg.to_string())
    }

    /// Create a device-access error from any displayable type.
    pub fn device_denied(msg: impl std::fmt::Display) -> Self {
        Self::DeviceAccessDenied(msg.to_string())
    }

    /// Create an unsupported-capability error from any displayable type.
    pub fn unsupported(msg: impl std::fmt::Display) -> Self {
        Self::UnsupportedCapability(msg.to_string())
    }

    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a peer-connection error from any displayable type.
    pub fn peer(msg: impl std::fmt::Display) -> Self {
        Self::Peer(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Errors that are handled where they occur: the session logs them and
    /// keeps running in a degraded mode.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedMessage(_) | Self::DeviceAccessDenied(_) | Self::UnsupportedCapability(_)
        )
    }
}
