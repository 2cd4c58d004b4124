//! Error types for the RTP relay

use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Direction of a forwarder task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    WhatsAppToSip,
    SipToWhatsApp,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WhatsAppToSip => write!(f, "whatsapp->sip"),
            Self::SipToWhatsApp => write!(f, "sip->whatsapp"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// No free port, or the requested port could not be bound
    #[error("RTP bind error: {message}")]
    RtpBind { port: Option<u16>, message: String },

    /// A forwarder hit a non-timeout socket error
    #[error("RTP forwarder error ({direction}): {message}")]
    RtpForwarder { direction: Direction, message: String },

    #[error("No RTP stream for call {call_id}")]
    StreamNotFound { call_id: String },

    #[error("Cannot resolve RTP endpoint {endpoint}: {message}")]
    Resolve { endpoint: String, message: String },

    #[error("Invalid media port range: {0}")]
    InvalidPortRange(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn bind(port: Option<u16>, message: impl Into<String>) -> Self {
        Self::RtpBind {
            port,
            message: message.into(),
        }
    }

    pub fn forwarder(direction: Direction, message: impl Into<String>) -> Self {
        Self::RtpForwarder {
            direction,
            message: message.into(),
        }
    }

    pub fn not_found(call_id: impl Into<String>) -> Self {
        Self::StreamNotFound {
            call_id: call_id.into(),
        }
    }

    pub fn is_bind_error(&self) -> bool {
        matches!(self, Self::RtpBind { .. })
    }
}
