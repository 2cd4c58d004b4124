//! Address bootstrap for SIP and RTP.
//!
//! The [`NetworkManager`] resolves three values before any signaling or
//! media traffic is produced:
//!
//! - the local IPv4 (routing lookup towards a public address, then an
//!   interface scan),
//! - the public IPv4 (operator supplied, else STUN, else the local IPv4),
//! - the local UDP port (whatever the kernel assigns when dialing the SIP
//!   server, unless one is configured).
//!
//! `configure` is idempotent: once it succeeds every later call returns the
//! same [`NetworkConfig`] without touching the network again.

use std::net::{Ipv4Addr, SocketAddr};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::lookup_host;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::interfaces::{connected_local_port, detect_local_ipv4, require_ipv4};
use crate::stun_client::{DEFAULT_STUN_FALLBACK_SERVERS, StunClient};

/// Inputs for network discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub sip_server: String,
    pub sip_port: u16,
    /// 0 means discover
    pub local_port: u16,
    /// Skip local address detection when set
    pub local_ip: Option<Ipv4Addr>,
    /// Empty means discover
    pub public_ip: String,
    /// Empty means no STUN at all
    pub stun_server: String,
    pub stun_fallback_servers: Vec<String>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            sip_server: String::new(),
            sip_port: 5060,
            local_port: 0,
            local_ip: None,
            public_ip: String::new(),
            stun_server: String::new(),
            stun_fallback_servers: DEFAULT_STUN_FALLBACK_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Addresses resolved by [`NetworkManager::configure`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub local_ip: Ipv4Addr,
    pub public_ip: Ipv4Addr,
    pub local_port: u16,
    pub sip_server: String,
    pub sip_port: u16,
}

impl NetworkConfig {
    /// `sip_server:sip_port`
    pub fn sip_target(&self) -> String {
        format!("{}:{}", self.sip_server, self.sip_port)
    }
}

pub struct NetworkManager {
    settings: NetworkSettings,
    stun: StunClient,
    config: RwLock<Option<NetworkConfig>>,
    configure_lock: Mutex<()>,
}

impl NetworkManager {
    pub fn new(settings: NetworkSettings) -> Self {
        Self::with_stun_client(settings, StunClient::new())
    }

    pub fn with_stun_client(settings: NetworkSettings, stun: StunClient) -> Self {
        Self {
            settings,
            stun,
            config: RwLock::new(None),
            configure_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    /// Resolve local IP, public IP and local port. Idempotent.
    pub async fn configure(&self) -> Result<NetworkConfig> {
        if let Some(config) = self.config.read().clone() {
            return Ok(config);
        }

        let _guard = self.configure_lock.lock().await;
        if let Some(config) = self.config.read().clone() {
            return Ok(config);
        }

        if self.settings.sip_server.trim().is_empty() {
            return Err(Error::network_config("SIP server is not configured"));
        }

        let local_ip = match self.settings.local_ip {
            Some(ip) => ip,
            None => detect_local_ipv4()?,
        };
        debug!("Local IP: {}", local_ip);

        let public_ip = self.discover_public_ip(local_ip).await;
        let local_port = self.acquire_local_port().await?;

        let config = NetworkConfig {
            local_ip,
            public_ip,
            local_port,
            sip_server: self.settings.sip_server.clone(),
            sip_port: self.settings.sip_port,
        };
        info!(
            "Network configured: local={} public={} port={} server={}",
            config.local_ip,
            config.public_ip,
            config.local_port,
            config.sip_target()
        );

        *self.config.write() = Some(config.clone());
        Ok(config)
    }

    async fn discover_public_ip(&self, local_ip: Ipv4Addr) -> Ipv4Addr {
        let configured = self.settings.public_ip.trim();
        if !configured.is_empty() {
            match configured.parse::<Ipv4Addr>() {
                Ok(ip) => return ip,
                Err(_) => warn!("Configured public IP '{}' is not IPv4, ignoring it", configured),
            }
        }

        if self.settings.stun_server.trim().is_empty() {
            debug!("No STUN server configured, assuming no NAT");
            return local_ip;
        }

        let mut servers = Vec::with_capacity(1 + self.settings.stun_fallback_servers.len());
        servers.push(self.settings.stun_server.clone());
        servers.extend(self.settings.stun_fallback_servers.iter().cloned());

        match self.stun.discover(&servers).await {
            Ok(ip) => ip,
            Err(e) => {
                warn!("{}; using local IP {} as public IP", e, local_ip);
                local_ip
            }
        }
    }

    async fn acquire_local_port(&self) -> Result<u16> {
        if self.settings.local_port != 0 {
            return Ok(self.settings.local_port);
        }

        let target = self.sip_server_addr().await?;
        let port = connected_local_port(target)?;
        debug!("Kernel assigned local port {} towards {}", port, target);
        Ok(port)
    }

    /// Resolve the SIP server to an IPv4 socket address
    pub async fn sip_server_addr(&self) -> Result<SocketAddr> {
        let target = format!("{}:{}", self.settings.sip_server.trim(), self.settings.sip_port);
        let mut addrs = lookup_host(&target)
            .await
            .map_err(|e| Error::network_config(format!("cannot resolve {}: {}", target, e)))?;
        let addr = addrs
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| Error::network_config(format!("{} has no IPv4 address", target)))?;
        require_ipv4(addr.ip())?;
        Ok(addr)
    }

    pub fn is_configured(&self) -> bool {
        self.config.read().is_some()
    }

    /// Snapshot of the resolved addresses, if `configure` has succeeded
    pub fn config(&self) -> Option<NetworkConfig> {
        self.config.read().clone()
    }

    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        self.config.read().as_ref().map(|c| c.local_ip)
    }

    pub fn public_ip(&self) -> Option<Ipv4Addr> {
        self.config.read().as_ref().map(|c| c.public_ip)
    }

    pub fn local_port(&self) -> Option<u16> {
        self.config.read().as_ref().map(|c| c.local_port)
    }

    pub fn sip_server(&self) -> &str {
        &self.settings.sip_server
    }

    pub fn sip_port(&self) -> u16 {
        self.settings.sip_port
    }
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("sip_server", &self.settings.sip_server)
            .field("sip_port", &self.settings.sip_port)
            .field("config", &*self.config.read())
            .finish()
    }
}
