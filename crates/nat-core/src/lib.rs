//! Network bootstrap for the QuePasa SIP proxy.
//!
//! This crate answers the questions the proxy must settle before it sends a
//! single SIP or RTP packet: which local IPv4 to advertise, which public IPv4
//! the SIP server will see (via STUN when behind NAT), which local UDP port
//! the signaling socket uses, and optionally how to punch that port through a
//! UPnP gateway.

// Error handling
pub mod error;

// STUN wire format and client
pub mod stun;
pub mod stun_client;

// Local address probing
pub mod interfaces;

// Discovery orchestration
pub mod network;

// UPnP IGD port mapping
pub mod upnp;

pub use error::{Error, Result};
pub use network::{NetworkConfig, NetworkManager, NetworkSettings};
pub use stun::{StunAttribute, StunAttributeType, StunMessage, StunMessageType};
pub use stun_client::{DEFAULT_STUN_FALLBACK_SERVERS, StunClient};
pub use upnp::{IgdPortMapper, MappingProtocol, PORT_MAPPING_DESCRIPTION, PortMapper, UpnpManager};
