//! RTP media bridge between WhatsApp and a SIP server.
//!
//! Each call gets a pair of even UDP ports: the WhatsApp side sends audio to
//! the WhatsApp-facing port, the SIP server exchanges audio with the
//! SIP-facing port. Two forwarder tasks copy datagrams between them without
//! looking inside. The relay is not an RTP endpoint: no RTCP, no jitter
//! buffer, no transcoding.

pub mod allocator;
pub mod error;
pub mod forwarder;
pub mod proxy;
pub mod stream;

pub use allocator::{DEFAULT_MAX_PORT, DEFAULT_MIN_PORT, PortAllocator};
pub use error::{Direction, Error, Result};
pub use forwarder::ForwarderConfig;
pub use proxy::{RtpProxy, RtpProxyConfig};
pub use stream::{DirectionTiming, RemoteEndpoint, RtpStream, StreamStats};
