//! Error types for the SIP proxy

use thiserror::Error;

/// Result type for SIP proxy operations
pub type Result<T> = std::result::Result<T, SipProxyError>;

/// Errors that can occur in the SIP proxy
#[derive(Debug, Error)]
pub enum SipProxyError {
    /// Address discovery, STUN or UPnP failure
    #[error(transparent)]
    Network(#[from] quepasa_nat_core::Error),

    /// RTP relay failure
    #[error(transparent)]
    Rtp(#[from] quepasa_rtp_proxy::Error),

    /// The Call-ID is already active with another caller/callee pair
    #[error("Call-ID {call_id} already in use for {from} -> {to}")]
    DuplicateCallId { call_id: String, from: String, to: String },

    /// Every INVITE allowed for this Call-ID has been sent
    #[error("Call-ID {call_id} already used its {attempts} INVITE attempt(s)")]
    AttemptsExhausted { call_id: String, attempts: u32 },

    /// A request could not be written to the socket
    #[error("Transport send error: {message}")]
    TransportSend { message: String },

    /// The SIP server answered with a final non-2xx response
    #[error("Dialog rejected: {code} {reason}")]
    DialogRejected { code: u16, reason: String },

    /// No final response arrived in time
    #[error("Dialog timed out after {seconds} seconds")]
    DialogTimeout { seconds: u64 },

    /// The call was cancelled locally or by the server
    #[error("Call {call_id} was cancelled")]
    Cancelled { call_id: String },

    /// Unknown call
    #[error("Call not found: {call_id}")]
    CallNotFound { call_id: String },

    /// Malformed SIP datagram
    #[error("SIP parse error: {message}")]
    Parse { message: String },

    /// Invalid settings
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Operation requires a started proxy
    #[error("SIP proxy is not running")]
    NotRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SipProxyError {
    /// Create a transport send error
    pub fn transport_send(message: impl Into<String>) -> Self {
        Self::TransportSend {
            message: message.into(),
        }
    }

    /// Create a parse error
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn call_not_found(call_id: impl Into<String>) -> Self {
        Self::CallNotFound {
            call_id: call_id.into(),
        }
    }

    /// Address discovery failed; signaling cannot start
    pub fn is_network_error(&self) -> bool {
        matches!(self, Self::Network(quepasa_nat_core::Error::NetworkConfig { .. }))
    }

    /// The SIP server or the clock ended the call attempt
    pub fn is_dialog_failure(&self) -> bool {
        matches!(self, Self::DialogRejected { .. } | Self::DialogTimeout { .. })
    }

    /// SIP status code equivalent, used when reporting failures to WhatsApp
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::DialogRejected { code, .. } => Some(*code),
            Self::DialogTimeout { .. } => Some(408),
            Self::Cancelled { .. } => Some(487),
            _ => None,
        }
    }
}
