//! Best-effort UPnP IGD port mapping.
//!
//! Every failure is logged and handed back to the caller as
//! [`Error::UpnpUnavailable`]; nothing here is fatal for the proxy.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use igd_next::aio::Gateway;
use igd_next::aio::tokio::{Tokio, search_gateway};
use igd_next::{PortMappingProtocol, SearchOptions};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Description attached to every mapping we create
pub const PORT_MAPPING_DESCRIPTION: &str = "QuePasa SIP Proxy";

/// How long SSDP discovery may take
pub const GATEWAY_SEARCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingProtocol {
    Udp,
    Tcp,
}

impl MappingProtocol {
    /// Parse "UDP"/"TCP" case-insensitively
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "UDP" => Some(Self::Udp),
            "TCP" => Some(Self::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for MappingProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "UDP"),
            Self::Tcp => write!(f, "TCP"),
        }
    }
}

impl From<MappingProtocol> for PortMappingProtocol {
    fn from(value: MappingProtocol) -> Self {
        match value {
            MappingProtocol::Udp => PortMappingProtocol::UDP,
            MappingProtocol::Tcp => PortMappingProtocol::TCP,
        }
    }
}

/// Operations needed from an Internet Gateway Device
#[async_trait]
pub trait PortMapper: Send + Sync {
    async fn external_ip(&self) -> Result<IpAddr>;

    /// Permanent mapping (lease 0) of `external_port` to `local`
    async fn add_port(&self, protocol: MappingProtocol, external_port: u16, local: SocketAddr, description: &str) -> Result<()>;

    async fn remove_port(&self, protocol: MappingProtocol, external_port: u16) -> Result<()>;
}

/// [`PortMapper`] backed by a gateway found over SSDP
pub struct IgdPortMapper {
    gateway: Gateway<Tokio>,
}

impl IgdPortMapper {
    pub async fn discover(search_timeout: Duration) -> Result<Self> {
        let options = SearchOptions {
            timeout: Some(search_timeout),
            ..Default::default()
        };
        let gateway = search_gateway(options)
            .await
            .map_err(|e| Error::upnp_unavailable(format!("gateway search failed: {}", e)))?;
        debug!("Found IGD at {}", gateway.addr);
        Ok(Self { gateway })
    }
}

#[async_trait]
impl PortMapper for IgdPortMapper {
    async fn external_ip(&self) -> Result<IpAddr> {
        self.gateway
            .get_external_ip()
            .await
            .map_err(|e| Error::upnp_unavailable(format!("GetExternalIPAddress failed: {}", e)))
    }

    async fn add_port(&self, protocol: MappingProtocol, external_port: u16, local: SocketAddr, description: &str) -> Result<()> {
        self.gateway
            .add_port(protocol.into(), external_port, local, 0, description)
            .await
            .map_err(|e| Error::upnp_unavailable(format!("AddPortMapping {} {} failed: {}", protocol, external_port, e)))
    }

    async fn remove_port(&self, protocol: MappingProtocol, external_port: u16) -> Result<()> {
        self.gateway
            .remove_port(protocol.into(), external_port)
            .await
            .map_err(|e| Error::upnp_unavailable(format!("DeletePortMapping {} {} failed: {}", protocol, external_port, e)))
    }
}

/// Keeps track of the mappings this process created
pub struct UpnpManager {
    mapper: Mutex<Option<Arc<dyn PortMapper>>>,
    mapped: Mutex<HashSet<(u16, MappingProtocol)>>,
    search_timeout: Duration,
}

impl Default for UpnpManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UpnpManager {
    pub fn new() -> Self {
        Self {
            mapper: Mutex::new(None),
            mapped: Mutex::new(HashSet::new()),
            search_timeout: GATEWAY_SEARCH_TIMEOUT,
        }
    }

    /// Use an already discovered gateway
    pub fn with_mapper(mapper: Arc<dyn PortMapper>) -> Self {
        let manager = Self::new();
        *manager.mapper.lock() = Some(mapper);
        manager
    }

    /// Discover a gateway unless one is already known
    pub async fn setup(&self) -> Result<()> {
        if self.is_available() {
            return Ok(());
        }
        match IgdPortMapper::discover(self.search_timeout).await {
            Ok(mapper) => {
                info!("UPnP gateway discovered");
                *self.mapper.lock() = Some(Arc::new(mapper));
                Ok(())
            }
            Err(e) => {
                warn!("UPnP setup failed: {}", e);
                Err(e)
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.mapper.lock().is_some()
    }

    fn mapper(&self) -> Result<Arc<dyn PortMapper>> {
        self.mapper
            .lock()
            .clone()
            .ok_or_else(|| Error::upnp_unavailable("no gateway discovered"))
    }

    /// Map `port` on the gateway to `local_ip:port`
    pub async fn open_port(&self, port: u16, protocol: MappingProtocol, local_ip: Ipv4Addr) -> Result<()> {
        let mapper = self.mapper()?;
        let local = SocketAddr::new(IpAddr::V4(local_ip), port);
        if let Err(e) = mapper.add_port(protocol, port, local, PORT_MAPPING_DESCRIPTION).await {
            warn!("{}", e);
            return Err(e);
        }
        info!("UPnP mapping added: {} {} -> {}", protocol, port, local);
        self.mapped.lock().insert((port, protocol));
        Ok(())
    }

    /// Remove a mapping we created. Unknown mappings are a no-op.
    pub async fn close_port(&self, port: u16, protocol: MappingProtocol) -> Result<()> {
        if !self.mapped.lock().remove(&(port, protocol)) {
            return Ok(());
        }
        let mapper = self.mapper()?;
        match mapper.remove_port(protocol, port).await {
            Ok(()) => {
                info!("UPnP mapping removed: {} {}", protocol, port);
                Ok(())
            }
            Err(e) => {
                warn!("{}", e);
                Err(e)
            }
        }
    }

    /// Remove every mapping still registered
    pub async fn close_all(&self) {
        let mappings: Vec<_> = self.mapped.lock().iter().copied().collect();
        for (port, protocol) in mappings {
            let _ = self.close_port(port, protocol).await;
        }
    }

    pub async fn external_ip(&self) -> Result<Ipv4Addr> {
        match self.mapper()?.external_ip().await? {
            IpAddr::V4(ip) => Ok(ip),
            IpAddr::V6(ip) => Err(Error::upnp_unavailable(format!("gateway reported IPv6 address {}", ip))),
        }
    }

    pub fn mapped_ports(&self) -> Vec<(u16, MappingProtocol)> {
        self.mapped.lock().iter().copied().collect()
    }
}

impl fmt::Debug for UpnpManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpnpManager")
            .field("available", &self.is_available())
            .field("mapped", &*self.mapped.lock())
            .finish()
    }
}
