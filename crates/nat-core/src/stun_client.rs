//! Public IPv4 discovery over STUN.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{UdpSocket, lookup_host};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::stun::{StunMessage, StunMessageType};

/// How long to wait for a Binding response from one server
pub const STUN_TIMEOUT: Duration = Duration::from_secs(5);

/// Public servers tried after the configured one
pub const DEFAULT_STUN_FALLBACK_SERVERS: [&str; 7] = [
    "stun1.l.google.com:19302",
    "stun2.l.google.com:19302",
    "stun3.l.google.com:19302",
    "stun4.l.google.com:19302",
    "stun.stunprotocol.org:3478",
    "stun.sipgate.net:3478",
    "stun.ekiga.net:3478",
];

/// Sends one Binding Request per server until an IPv4 mapping comes back
#[derive(Debug, Clone)]
pub struct StunClient {
    timeout: Duration,
}

impl Default for StunClient {
    fn default() -> Self {
        Self::new()
    }
}

impl StunClient {
    pub fn new() -> Self {
        Self { timeout: STUN_TIMEOUT }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Try every server in order and return the first public IPv4 learned.
    ///
    /// Empty entries and entries with port 0 are skipped. Fails with
    /// [`Error::StunUnavailable`] once the list is exhausted.
    pub async fn discover<S: AsRef<str>>(&self, servers: &[S]) -> Result<Ipv4Addr> {
        let mut tried = 0usize;
        for server in servers {
            let server = server.as_ref().trim();
            if !is_usable_server(server) {
                continue;
            }
            tried += 1;
            match self.query(server).await {
                Ok(ip) => {
                    info!("Discovered public IP {} via STUN server {}", ip, server);
                    return Ok(ip);
                }
                Err(e) => debug!("STUN server {} failed: {}", server, e),
            }
        }

        warn!("STUN discovery failed after trying {} servers", tried);
        Err(Error::stun_unavailable(format!("no server out of {} answered with an IPv4 mapping", tried)))
    }

    /// Send a single Binding Request to `server` ("host:port")
    pub async fn query(&self, server: &str) -> Result<Ipv4Addr> {
        let target = resolve_ipv4(server).await?;

        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect(target).await?;

        let request = StunMessage::binding_request();
        socket.send(&request.encode()).await?;

        let mut buf = [0u8; 1024];
        let len = match timeout(self.timeout, socket.recv(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::StunError(format!("no response from {} within {:?}", server, self.timeout))),
        };

        let response = StunMessage::decode(&buf[..len])?;
        if response.transaction_id != request.transaction_id {
            return Err(Error::StunError("transaction id mismatch".to_string()));
        }
        if response.msg_type != StunMessageType::BindingResponse {
            return Err(Error::StunError(format!("unexpected message type {:?}", response.msg_type)));
        }

        match response.mapped_address()? {
            SocketAddr::V4(addr) => Ok(*addr.ip()),
            SocketAddr::V6(addr) => Err(Error::StunError(format!("server mapped us to IPv6 {}", addr.ip()))),
        }
    }
}

fn is_usable_server(server: &str) -> bool {
    !server.is_empty() && !server.ends_with(":0")
}

async fn resolve_ipv4(server: &str) -> Result<SocketAddr> {
    lookup_host(server)
        .await?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| Error::StunError(format!("{} has no IPv4 address", server)))
}
