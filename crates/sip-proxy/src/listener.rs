//! Inbound signaling socket.
//!
//! The listener takes the first free UDP port from a preferred range, then
//! from a fallback range, and finally lets the OS choose. Whatever arrives on
//! it goes to the [`ResponseHandler`] unfiltered.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;
use crate::response_handler::{ResponseHandler, spawn_dispatcher};
use crate::transport::{Transport, UdpTransport};

pub const PREFERRED_PORTS: RangeInclusive<u16> = 5060..=5080;
pub const FALLBACK_PORTS: RangeInclusive<u16> = 10000..=11000;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_ip: IpAddr,
    pub preferred: RangeInclusive<u16>,
    pub fallback: RangeInclusive<u16>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            preferred: PREFERRED_PORTS,
            fallback: FALLBACK_PORTS,
        }
    }
}

struct Running {
    transport: Arc<UdpTransport>,
    dispatcher: JoinHandle<()>,
}

pub struct SipListener {
    config: ListenerConfig,
    running: Mutex<Option<Running>>,
}

impl SipListener {
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
        }
    }

    /// Bind and start dispatching. Returns the bound port; a second call
    /// returns the port already in use.
    pub fn start(&self, handler: Arc<ResponseHandler>) -> Result<u16> {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            return current.transport.local_addr().map(|addr| addr.port());
        }

        let socket = self.bind_first_free()?;
        let (transport, events) = UdpTransport::from_socket(socket, None)?;
        let transport = Arc::new(transport);
        let port = transport.local_addr()?.port();

        let dispatcher = spawn_dispatcher(handler, transport.clone() as Arc<dyn Transport>, events);
        info!("SIP listener on UDP port {}", port);
        *running = Some(Running { transport, dispatcher });
        Ok(port)
    }

    fn bind_first_free(&self) -> Result<UdpSocket> {
        let candidates = self.config.preferred.clone().chain(self.config.fallback.clone());
        for port in candidates.filter(|p| *p != 0) {
            if let Some(socket) = try_bind(SocketAddr::new(self.config.bind_ip, port)) {
                return Ok(socket);
            }
        }
        debug!("No listener port free in configured ranges, letting the OS choose");
        try_bind(SocketAddr::new(self.config.bind_ip, 0))
            .ok_or_else(|| std::io::Error::other("cannot bind SIP listener").into())
    }

    pub fn port(&self) -> Option<u16> {
        self.running
            .lock()
            .as_ref()
            .and_then(|r| r.transport.local_addr().ok())
            .map(|addr| addr.port())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.transport.close().await;
            running.dispatcher.abort();
            info!("SIP listener stopped");
        }
    }
}

impl Default for SipListener {
    fn default() -> Self {
        Self::new(ListenerConfig::default())
    }
}

impl std::fmt::Debug for SipListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SipListener").field("port", &self.port()).finish()
    }
}

/// Bind a non-blocking std socket and hand it to tokio
fn try_bind(addr: SocketAddr) -> Option<UdpSocket> {
    let socket = std::net::UdpSocket::bind(addr).ok()?;
    socket.set_nonblocking(true).ok()?;
    UdpSocket::from_std(socket).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_manager::CallManager;
    use crate::config::Settings;
    use crate::transaction::TransactionMonitor;
    use quepasa_nat_core::NetworkManager;
    use quepasa_rtp_proxy::RtpProxy;
    use std::time::Duration;

    fn handler() -> Arc<ResponseHandler> {
        let settings = Settings::new("127.0.0.1", 5060);
        let calls = Arc::new(CallManager::new(
            settings.clone(),
            Arc::new(NetworkManager::new(settings.network_settings())),
            Arc::new(RtpProxy::default()),
            Arc::new(TransactionMonitor::new(Duration::from_secs(60))),
        ));
        Arc::new(ResponseHandler::new(calls, "test"))
    }

    fn loopback(preferred: RangeInclusive<u16>, fallback: RangeInclusive<u16>) -> SipListener {
        SipListener::new(ListenerConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            preferred,
            fallback,
        })
    }

    #[tokio::test]
    async fn walks_to_fallback_range() {
        let _busy_a = std::net::UdpSocket::bind("127.0.0.1:34010").unwrap();
        let _busy_b = std::net::UdpSocket::bind("127.0.0.1:34011").unwrap();

        let listener = loopback(34010..=34011, 34020..=34030);
        let port = listener.start(handler()).unwrap();
        assert!((34020..=34030).contains(&port));
        assert_eq!(listener.port(), Some(port));

        // idempotent
        assert_eq!(listener.start(handler()).unwrap(), port);

        listener.stop().await;
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn falls_back_to_os_port() {
        let _busy = std::net::UdpSocket::bind("127.0.0.1:34040").unwrap();
        let listener = loopback(34040..=34040, 34040..=34040);
        let port = listener.start(handler()).unwrap();
        assert_ne!(port, 34040);
        assert_ne!(port, 0);
        listener.stop().await;
    }

    #[tokio::test]
    async fn answers_bye_for_unknown_call() {
        let listener = loopback(34050..=34060, 34061..=34070);
        let port = listener.start(handler()).unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bye = "BYE sip:a@127.0.0.1 SIP/2.0\r\n\
            Via: SIP/2.0/UDP 127.0.0.1;branch=z9hG4bKpeer\r\n\
            From: <sip:b@127.0.0.1>;tag=p\r\n\
            To: <sip:a@127.0.0.1>;tag=q\r\n\
            Call-ID: nobody\r\n\
            CSeq: 2 BYE\r\n\
            Content-Length: 0\r\n\r\n";
        peer.send_to(bye.as_bytes(), ("127.0.0.1", port)).await.unwrap();

        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let text = std::str::from_utf8(&buf[..len]).unwrap();
        assert!(text.starts_with("SIP/2.0 200 OK\r\n"));
        assert!(text.contains("Call-ID: nobody\r\n"));
        listener.stop().await;
    }
}
