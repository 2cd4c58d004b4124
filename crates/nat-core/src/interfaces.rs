//! Local IPv4 selection.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Address used only to let the kernel pick a route; nothing is sent to it
const ROUTE_TARGET: &str = "8.8.8.8:80";

/// Pick the local IPv4 the host would use for outbound traffic.
///
/// Tries the routing table first, then falls back to scanning interfaces.
pub fn detect_local_ipv4() -> Result<Ipv4Addr> {
    match routed_ipv4(ROUTE_TARGET) {
        Some(ip) => return Ok(ip),
        None => debug!("Routing lookup gave no usable IPv4, scanning interfaces"),
    }

    interface_ipv4_addresses()
        .into_iter()
        .next()
        .ok_or_else(|| Error::network_config("no non-loopback IPv4 address on any interface"))
}

/// Source address the kernel chooses for a UDP "connection" to `target`
pub fn routed_ipv4(target: &str) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    if let Err(e) = socket.connect(target) {
        debug!("Routing lookup towards {} failed: {}", target, e);
        return None;
    }
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) if is_usable(*addr.ip()) => Some(*addr.ip()),
        _ => None,
    }
}

/// Local port the kernel picks when dialing `target`, used as the SIP source port
pub fn connected_local_port(target: SocketAddr) -> Result<u16> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket
        .connect(target)
        .map_err(|e| Error::network_config(format!("cannot dial {}: {}", target, e)))?;
    let port = socket.local_addr()?.port();
    if port == 0 {
        return Err(Error::network_config(format!("no local port assigned dialing {}", target)));
    }
    Ok(port)
}

fn is_usable(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified()
}

/// IPv4 addresses of interfaces that are up and not loopback
#[cfg(unix)]
pub fn interface_ipv4_addresses() -> Vec<Ipv4Addr> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;

    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("Could not enumerate network interfaces: {}", e);
            return Vec::new();
        }
    };

    addrs
        .filter(|ifa| ifa.flags.contains(InterfaceFlags::IFF_UP))
        .filter(|ifa| !ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK))
        .filter_map(|ifa| {
            let sin = ifa.address.as_ref()?.as_sockaddr_in()?;
            let ip = *std::net::SocketAddrV4::from(*sin).ip();
            is_usable(ip).then_some(ip)
        })
        .collect()
}

#[cfg(not(unix))]
pub fn interface_ipv4_addresses() -> Vec<Ipv4Addr> {
    warn!("Interface enumeration is not supported on this platform");
    Vec::new()
}

/// Reduce an arbitrary address to IPv4, rejecting IPv6
pub fn require_ipv4(ip: IpAddr) -> Result<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => Ok(v4),
            None => Err(Error::network_config(format!("{} is not an IPv4 address", v6))),
        },
    }
}
