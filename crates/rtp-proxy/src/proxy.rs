//! Stream registry: port selection, socket ownership and forwarder lifecycle.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::{UdpSocket, lookup_host};
use tracing::{debug, info, warn};

use crate::allocator::{PortAllocator, bind_exact};
use crate::error::{Error, Result};
use crate::forwarder::{ForwarderConfig, sip_to_whatsapp, whatsapp_to_sip};
use crate::stream::{RemoteEndpoint, RtpStream, StreamStats};

/// Relay configuration
#[derive(Debug, Clone, Default)]
pub struct RtpProxyConfig {
    pub ports: PortAllocator,
    pub forwarder: ForwarderConfig,
}

#[derive(Default)]
struct StreamTable {
    streams: HashMap<String, Arc<RtpStream>>,
    /// WhatsApp-facing ports promised in an SDP offer but not bound yet
    reservations: HashMap<String, u16>,
}

impl StreamTable {
    /// Ports owned by streams or promised to calls other than `call_id`
    fn ports_in_use(&self, call_id: &str) -> HashSet<u16> {
        let mut ports: HashSet<u16> = self
            .streams
            .values()
            .flat_map(|s| [s.whatsapp_port(), s.sip_port()])
            .collect();
        ports.extend(
            self.reservations
                .iter()
                .filter(|(owner, _)| owner.as_str() != call_id)
                .map(|(_, port)| *port),
        );
        ports
    }
}

/// Bidirectional UDP relay, one stream per call
pub struct RtpProxy {
    config: RtpProxyConfig,
    table: RwLock<StreamTable>,
}

impl Default for RtpProxy {
    fn default() -> Self {
        Self::new(RtpProxyConfig::default())
    }
}

impl RtpProxy {
    pub fn new(config: RtpProxyConfig) -> Self {
        Self {
            config,
            table: RwLock::new(StreamTable::default()),
        }
    }

    pub fn config(&self) -> &RtpProxyConfig {
        &self.config
    }

    /// Create a relay for `call_id`, picking both ports from the media range.
    ///
    /// An existing stream for the same call is returned untouched.
    pub async fn create_stream(&self, call_id: &str, remote_host: &str, remote_port: u16) -> Result<Arc<RtpStream>> {
        if let Some(existing) = self.stream(call_id) {
            debug!(call_id, "RTP stream already exists");
            return Ok(existing);
        }
        let remote = resolve(remote_host, remote_port).await?;

        let (stream, whatsapp, sip) = {
            let mut table = self.table.write();
            if let Some(existing) = table.streams.get(call_id) {
                return Ok(existing.clone());
            }

            let mut excluded = table.ports_in_use(call_id);
            let (whatsapp_port, whatsapp) = self.config.ports.bind_any(&excluded)?;
            excluded.insert(whatsapp_port);
            let (sip_port, sip) = self.config.ports.bind_any(&excluded)?;

            let (stream, whatsapp, sip) = register(&mut table, call_id, whatsapp_port, whatsapp, sip_port, sip, remote)?;
            (stream, whatsapp, sip)
        };

        self.spawn_forwarders(&stream, whatsapp, sip);
        Ok(stream)
    }

    /// Create a relay whose WhatsApp side is bound on exactly `whatsapp_port`.
    ///
    /// Used when the port was already advertised in SDP. Fails with an
    /// [`Error::RtpBind`] instead of falling back to another port.
    pub async fn create_stream_with_local_port(
        &self,
        call_id: &str,
        whatsapp_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Arc<RtpStream>> {
        if let Some(existing) = self.stream(call_id) {
            if existing.whatsapp_port() != whatsapp_port {
                warn!(call_id, "RTP stream exists on port {}, not {}", existing.whatsapp_port(), whatsapp_port);
            }
            return Ok(existing);
        }
        if !self.config.ports.accepts(whatsapp_port) {
            let range = self.config.ports.range();
            return Err(Error::bind(
                Some(whatsapp_port),
                format!("port {} is not an even port in {}-{}", whatsapp_port, range.start(), range.end()),
            ));
        }
        let remote = resolve(remote_host, remote_port).await?;

        let (stream, whatsapp, sip) = {
            let mut table = self.table.write();
            if let Some(existing) = table.streams.get(call_id) {
                return Ok(existing.clone());
            }

            let mut excluded = table.ports_in_use(call_id);
            if excluded.contains(&whatsapp_port) {
                return Err(Error::bind(Some(whatsapp_port), format!("port {} is owned by another call", whatsapp_port)));
            }
            let whatsapp = bind_exact(whatsapp_port)?;
            excluded.insert(whatsapp_port);
            let (sip_port, sip) = self.config.ports.bind_any(&excluded)?;

            register(&mut table, call_id, whatsapp_port, whatsapp, sip_port, sip, remote)?
        };

        self.spawn_forwarders(&stream, whatsapp, sip);
        Ok(stream)
    }

    fn spawn_forwarders(&self, stream: &Arc<RtpStream>, whatsapp: UdpSocket, sip: UdpSocket) {
        let whatsapp = Arc::new(whatsapp);
        let sip = Arc::new(sip);
        let config = self.config.forwarder.clone();

        tokio::spawn(whatsapp_to_sip(stream.clone(), whatsapp.clone(), sip.clone(), config.clone()));
        tokio::spawn(sip_to_whatsapp(stream.clone(), whatsapp, sip, config));

        info!(
            call_id = %stream.call_id(),
            "RTP relay started: whatsapp port {} <-> sip port {} -> {}",
            stream.whatsapp_port(),
            stream.sip_port(),
            stream.remote_addr()
        );
    }

    /// Pick the WhatsApp-facing port for a call before the stream exists
    pub fn reserve_port(&self, call_id: &str) -> Result<u16> {
        let mut table = self.table.write();
        if let Some(stream) = table.streams.get(call_id) {
            return Ok(stream.whatsapp_port());
        }
        if let Some(port) = table.reservations.get(call_id) {
            return Ok(*port);
        }
        let port = self.config.ports.find_free(&table.ports_in_use(call_id))?;
        table.reservations.insert(call_id.to_string(), port);
        debug!(call_id, "Reserved RTP port {}", port);
        Ok(port)
    }

    pub fn release_reservation(&self, call_id: &str) -> Option<u16> {
        self.table.write().reservations.remove(call_id)
    }

    pub fn reserved_port(&self, call_id: &str) -> Option<u16> {
        self.table.read().reservations.get(call_id).copied()
    }

    /// Stop both forwarders and release the sockets. Unknown calls are a no-op.
    pub fn stop_stream(&self, call_id: &str) -> bool {
        let removed = {
            let mut table = self.table.write();
            table.reservations.remove(call_id);
            table.streams.remove(call_id)
        };
        match removed {
            Some(stream) => {
                stream.deactivate();
                let stats = stream.stats();
                info!(
                    call_id,
                    "RTP relay stopped: {} packets / {} bytes to SIP, {} packets / {} bytes to WhatsApp",
                    stats.packets_to_sip,
                    stats.bytes_to_sip,
                    stats.packets_to_whatsapp,
                    stats.bytes_to_whatsapp
                );
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let call_ids: Vec<String> = self.table.read().streams.keys().cloned().collect();
        for call_id in call_ids {
            self.stop_stream(&call_id);
        }
    }

    /// Redirect SIP-bound packets of an existing stream
    pub async fn update_server_endpoint(&self, call_id: &str, host: &str, port: u16) -> Result<()> {
        let remote = resolve(host, port).await?;
        let table = self.table.write();
        let stream = table.streams.get(call_id).ok_or_else(|| Error::not_found(call_id))?;
        info!(call_id, "RTP remote endpoint {} -> {}", stream.remote_addr(), remote.addr);
        stream.set_remote(remote);
        Ok(())
    }

    pub fn stream(&self, call_id: &str) -> Option<Arc<RtpStream>> {
        self.table.read().streams.get(call_id).cloned()
    }

    pub fn stream_stats(&self, call_id: &str) -> Option<StreamStats> {
        self.table.read().streams.get(call_id).map(|s| s.stats())
    }

    pub fn active_streams(&self) -> Vec<String> {
        self.table.read().streams.keys().cloned().collect()
    }

    pub fn stream_count(&self) -> usize {
        self.table.read().streams.len()
    }
}

fn register(
    table: &mut StreamTable,
    call_id: &str,
    whatsapp_port: u16,
    whatsapp: std::net::UdpSocket,
    sip_port: u16,
    sip: std::net::UdpSocket,
    remote: RemoteEndpoint,
) -> Result<(Arc<RtpStream>, UdpSocket, UdpSocket)> {
    let whatsapp = UdpSocket::from_std(whatsapp)?;
    let sip = UdpSocket::from_std(sip)?;

    let stream = Arc::new(RtpStream::new(call_id.to_string(), whatsapp_port, sip_port, remote));
    table.reservations.remove(call_id);
    table.streams.insert(call_id.to_string(), stream.clone());
    Ok((stream, whatsapp, sip))
}

async fn resolve(host: &str, port: u16) -> Result<RemoteEndpoint> {
    let endpoint = format!("{}:{}", host, port);
    let addrs: Vec<SocketAddr> = lookup_host(&endpoint)
        .await
        .map_err(|e| Error::Resolve {
            endpoint: endpoint.clone(),
            message: e.to_string(),
        })?
        .collect();
    let addr = first_ipv4(&addrs).ok_or_else(|| Error::Resolve {
        endpoint: endpoint.clone(),
        message: if addrs.is_empty() {
            "no addresses".to_string()
        } else {
            "no IPv4 address, relay sockets are bound on 0.0.0.0".to_string()
        },
    })?;
    Ok(RemoteEndpoint {
        host: host.to_string(),
        port,
        addr,
    })
}

/// Relay sockets are IPv4-only; an IPv6 result would fail on every send.
fn first_ipv4(addrs: &[SocketAddr]) -> Option<SocketAddr> {
    addrs.iter().find(|a| a.is_ipv4()).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_wins_over_earlier_ipv6() {
        let addrs: Vec<SocketAddr> = vec!["[2001:db8::1]:5004".parse().unwrap(), "198.51.100.7:5004".parse().unwrap()];
        assert_eq!(first_ipv4(&addrs), Some("198.51.100.7:5004".parse().unwrap()));
    }

    #[test]
    fn ipv6_only_has_no_usable_address() {
        let addrs: Vec<SocketAddr> = vec!["[2001:db8::1]:5004".parse().unwrap()];
        assert_eq!(first_ipv4(&addrs), None);
    }

    #[tokio::test]
    async fn ipv6_literal_is_a_resolve_error() {
        let err = resolve("::1", 5004).await.unwrap_err();
        assert!(matches!(err, Error::Resolve { .. }));

        let endpoint = resolve("127.0.0.1", 5004).await.unwrap();
        assert!(endpoint.addr.is_ipv4());
    }
}
