//! Error types for network discovery

use thiserror::Error;

/// Result type for NAT discovery operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while discovering addresses or mapping ports
#[derive(Debug, Error)]
pub enum Error {
    /// No usable IPv4 address or local port could be determined
    #[error("Network configuration error: {message}")]
    NetworkConfig { message: String },

    /// Every STUN server failed to produce an IPv4 mapping
    #[error("STUN unavailable: {message}")]
    StunUnavailable { message: String },

    /// Malformed or unexpected STUN packet
    #[error("STUN protocol error: {0}")]
    StunError(String),

    /// No IGD was found or the gateway refused the request
    #[error("UPnP unavailable: {message}")]
    UpnpUnavailable { message: String },

    /// Underlying socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a network configuration error
    pub fn network_config(message: impl Into<String>) -> Self {
        Self::NetworkConfig {
            message: message.into(),
        }
    }

    /// Create a STUN unavailable error
    pub fn stun_unavailable(message: impl Into<String>) -> Self {
        Self::StunUnavailable {
            message: message.into(),
        }
    }

    /// Create a UPnP unavailable error
    pub fn upnp_unavailable(message: impl Into<String>) -> Self {
        Self::UpnpUnavailable {
            message: message.into(),
        }
    }

    /// Whether the failure can be ignored by the caller
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::StunUnavailable { .. } | Self::StunError(_) | Self::UpnpUnavailable { .. }
        )
    }
}
