//! Configuration for the SIP proxy
//!
//! A single [`Settings`] record drives every component: the network
//! bootstrap, the signaling socket, the SDP offer and the RTP relay.
//!
//! ## Quick Start
//!
//! ```rust
//! use quepasa_sip_proxy::config::Settings;
//!
//! let settings = Settings::new("voip.example.com", 26499)
//!     .with_public_ip("203.0.113.5")
//!     .with_stun_server("");
//!
//! assert!(settings.validate().is_ok());
//! assert_eq!(settings.media_ports().unwrap(), 10000..=20000);
//! ```
//!
//! ## Discovery fields
//!
//! ```text
//! local_ip    None  -> routing lookup, then interface scan
//! public_ip   ""    -> STUN (stun_server, then stun_fallback_servers), then local IP
//! local_port  0     -> port the kernel picks when dialing sip_server:sip_port
//! stun_server ""    -> no STUN at all
//! ```
//!
//! Settings can also be read from JSON; missing fields take their defaults.

use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use quepasa_nat_core::{DEFAULT_STUN_FALLBACK_SERVERS, NetworkSettings};
use quepasa_rtp_proxy::PortAllocator;

use crate::error::{Result, SipProxyError};
use crate::logging::parse_log_level;

pub const DEFAULT_SIP_PORT: u16 = 5060;
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";
pub const DEFAULT_MEDIA_PORT_RANGE: &str = "10000-20000";
pub const DEFAULT_CODECS: &str = "PCMU,PCMA,G729";
pub const DEFAULT_USER_AGENT: &str = "QuePasa-SIPProxy/1.0";
pub const DEFAULT_SDP_SESSION_NAME: &str = "QuePasa SDP";
pub const DEFAULT_INVITE_TIMEOUT_SECS: u64 = 60;

/// Only one INVITE is ever sent per Call-ID
pub const SIP_INVITE_MAX_ATTEMPTS: u32 = 1;

/// Signaling transport. Only UDP is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SipTransportProtocol {
    #[default]
    Udp,
    Tcp,
    Tls,
}

impl std::fmt::Display for SipTransportProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp => write!(f, "UDP"),
            Self::Tcp => write!(f, "TCP"),
            Self::Tls => write!(f, "TLS"),
        }
    }
}

/// SIP proxy settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sip_server: String,
    pub sip_port: u16,
    /// 0 means discover
    pub local_port: u16,
    /// Skip local address detection when set
    pub local_ip: Option<Ipv4Addr>,
    /// Empty means discover
    pub public_ip: String,
    /// "host:port", empty disables STUN
    pub stun_server: String,
    pub stun_fallback_servers: Vec<String>,
    pub use_upnp: bool,
    /// "MIN-MAX"
    pub media_port_range: String,
    /// Comma separated, informational
    pub codecs: String,
    pub user_agent: String,
    pub sdp_session_name: String,
    pub protocol: SipTransportProtocol,
    pub timeout_seconds: u64,
    /// Reserved
    pub retries: u32,
    /// How long an INVITE may wait for a final response
    pub invite_timeout_seconds: u64,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sip_server: String::new(),
            sip_port: DEFAULT_SIP_PORT,
            local_port: 0,
            local_ip: None,
            public_ip: String::new(),
            stun_server: DEFAULT_STUN_SERVER.to_string(),
            stun_fallback_servers: DEFAULT_STUN_FALLBACK_SERVERS.iter().map(|s| s.to_string()).collect(),
            use_upnp: true,
            media_port_range: DEFAULT_MEDIA_PORT_RANGE.to_string(),
            codecs: DEFAULT_CODECS.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            sdp_session_name: DEFAULT_SDP_SESSION_NAME.to_string(),
            protocol: SipTransportProtocol::Udp,
            timeout_seconds: 30,
            retries: 3,
            invite_timeout_seconds: DEFAULT_INVITE_TIMEOUT_SECS,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn new(sip_server: impl Into<String>, sip_port: u16) -> Self {
        Self {
            sip_server: sip_server.into(),
            sip_port,
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SipProxyError::config(format!("invalid settings JSON: {}", e)))
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    pub fn with_local_ip(mut self, ip: Ipv4Addr) -> Self {
        self.local_ip = Some(ip);
        self
    }

    pub fn with_public_ip(mut self, ip: impl Into<String>) -> Self {
        self.public_ip = ip.into();
        self
    }

    pub fn with_stun_server(mut self, server: impl Into<String>) -> Self {
        self.stun_server = server.into();
        self
    }

    pub fn with_stun_fallback_servers(mut self, servers: Vec<String>) -> Self {
        self.stun_fallback_servers = servers;
        self
    }

    pub fn with_upnp(mut self, enabled: bool) -> Self {
        self.use_upnp = enabled;
        self
    }

    pub fn with_media_port_range(mut self, range: impl Into<String>) -> Self {
        self.media_port_range = range.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_sdp_session_name(mut self, name: impl Into<String>) -> Self {
        self.sdp_session_name = name.into();
        self
    }

    pub fn with_invite_timeout(mut self, timeout: Duration) -> Self {
        self.invite_timeout_seconds = timeout.as_secs().max(1);
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Server configured and port non-zero
    pub fn is_enabled(&self) -> bool {
        !self.sip_server.trim().is_empty() && self.sip_port != 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.sip_server.trim().is_empty() {
            return Err(SipProxyError::config("sip_server must be set"));
        }
        if self.sip_port == 0 {
            return Err(SipProxyError::config("sip_port must be greater than 0"));
        }
        if self.protocol != SipTransportProtocol::Udp {
            return Err(SipProxyError::config(format!("{} signaling is not supported, use UDP", self.protocol)));
        }
        if self.invite_timeout_seconds == 0 {
            return Err(SipProxyError::config("invite_timeout_seconds must be greater than 0"));
        }
        if !self.public_ip.trim().is_empty() && self.public_ip.trim().parse::<Ipv4Addr>().is_err() {
            return Err(SipProxyError::config(format!("public_ip '{}' is not an IPv4 address", self.public_ip)));
        }
        let ports = self.media_ports()?;
        if *ports.start() < 1024 {
            return Err(SipProxyError::config("media ports must be above 1023"));
        }
        parse_log_level(&self.log_level)?;
        Ok(())
    }

    /// Media port range after even alignment
    pub fn media_ports(&self) -> Result<RangeInclusive<u16>> {
        self.port_allocator().map(|allocator| allocator.range())
    }

    pub fn port_allocator(&self) -> Result<PortAllocator> {
        PortAllocator::parse(&self.media_port_range)
            .map_err(|e| SipProxyError::config(format!("media_port_range: {}", e)))
    }

    pub fn codec_list(&self) -> Vec<String> {
        self.codecs
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_seconds)
    }

    /// Inputs for the network bootstrap
    pub fn network_settings(&self) -> NetworkSettings {
        NetworkSettings {
            sip_server: self.sip_server.trim().to_string(),
            sip_port: self.sip_port,
            local_port: self.local_port,
            local_ip: self.local_ip,
            public_ip: self.public_ip.trim().to_string(),
            stun_server: self.stun_server.trim().to_string(),
            stun_fallback_servers: self.stun_fallback_servers.clone(),
        }
    }
}
