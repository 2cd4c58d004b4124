//! UDP signaling transport.
//!
//! One datagram is one SIP message. The receive loop does not interpret
//! what it reads; datagrams are handed to whoever owns the event channel
//! (the [`ResponseHandler`](crate::response_handler::ResponseHandler)).

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::error::{Result, SipProxyError};
use crate::message::{ResponseExt, SipMessage, to_bytes};

const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Largest datagram we accept
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Events emitted by a transport's receive loop
#[derive(Debug, Clone)]
pub enum TransportEvent {
    DatagramReceived {
        data: Bytes,
        source: SocketAddr,
        destination: SocketAddr,
    },
    Error {
        error: String,
    },
    Closed,
}

/// Something SIP messages can be sent through
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn local_addr(&self) -> Result<SocketAddr>;

    async fn send_message(&self, message: &SipMessage, destination: SocketAddr) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// UDP transport for SIP messages
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpTransportInner>,
}

struct UdpTransportInner {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    closed: AtomicBool,
    shutdown: CancellationToken,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl UdpTransport {
    /// Bind `addr` and start receiving
    pub async fn bind(addr: SocketAddr, channel_capacity: Option<usize>) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(socket, channel_capacity)
    }

    /// Wrap an already bound socket and start receiving
    pub fn from_socket(socket: UdpSocket, channel_capacity: Option<usize>) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let capacity = channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(capacity);

        let local_addr = socket.local_addr()?;
        info!("SIP UDP transport bound to {}", local_addr);

        let transport = UdpTransport {
            inner: Arc::new(UdpTransportInner {
                socket: Arc::new(socket),
                local_addr,
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                events_tx,
            }),
        };
        transport.spawn_receive_loop();

        Ok((transport, events_rx))
    }

    fn spawn_receive_loop(&self) {
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

            while !inner.closed.load(Ordering::Acquire) {
                let received = tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    received = inner.socket.recv_from(&mut buf) => received,
                };

                match received {
                    Ok((len, source)) => {
                        trace!("Received {} bytes from {}", len, source);
                        let event = TransportEvent::DatagramReceived {
                            data: Bytes::copy_from_slice(&buf[..len]),
                            source,
                            destination: inner.local_addr,
                        };
                        if inner.events_tx.send(event).await.is_err() {
                            debug!("Event receiver for {} dropped", inner.local_addr);
                            break;
                        }
                    }
                    Err(e) => {
                        if inner.closed.load(Ordering::Acquire) {
                            break;
                        }
                        // ICMP errors from earlier sends surface here on some platforms
                        error!("Error receiving UDP packet on {}: {}", inner.local_addr, e);
                        let _ = inner
                            .events_tx
                            .send(TransportEvent::Error {
                                error: format!("Error receiving packet: {}", e),
                            })
                            .await;
                    }
                }
            }

            let _ = inner.events_tx.send(TransportEvent::Closed).await;
            info!("UDP receive loop on {} terminated", inner.local_addr);
        });
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr)
    }

    async fn send_message(&self, message: &SipMessage, destination: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(SipProxyError::transport_send("transport is closed"));
        }

        let bytes = to_bytes(message);
        match message {
            SipMessage::Request(request) => debug!("Sending {} ({} bytes) to {}", request.method, bytes.len(), destination),
            SipMessage::Response(response) => debug!(
                "Sending {} {} ({} bytes) to {}",
                response.status(),
                response.reason(),
                bytes.len(),
                destination
            ),
        }

        let sent = self
            .inner
            .socket
            .send_to(&bytes, destination)
            .await
            .map_err(|e| SipProxyError::transport_send(format!("send to {} failed: {}", destination, e)))?;
        if sent != bytes.len() {
            return Err(SipProxyError::transport_send(format!(
                "short write to {}: {} of {} bytes",
                destination,
                sent,
                bytes.len()
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.shutdown.cancel();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpTransport({})", self.inner.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DialogHeaders, parse};
    use std::time::Duration;

    fn options() -> SipMessage {
        let raw = "OPTIONS sip:keepalive@127.0.0.1 SIP/2.0\r\n\
            Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKopt\r\n\
            Call-ID: t-1\r\n\
            CSeq: 1 OPTIONS\r\n\
            Content-Length: 0\r\n\r\n";
        parse(raw.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn delivers_datagrams_as_events() {
        let (transport, mut events) = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None).await.unwrap();
        let target = transport.local_addr().unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"OPTIONS sip:x SIP/2.0\r\n\r\n", target).await.unwrap();

        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
            Some(TransportEvent::DatagramReceived { data, source, destination }) => {
                assert_eq!(&data[..], b"OPTIONS sip:x SIP/2.0\r\n\r\n");
                assert_eq!(source, peer.local_addr().unwrap());
                assert_eq!(destination, target);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn sends_serialized_messages() {
        let (transport, _events) = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None).await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        transport.send_message(&options(), peer.local_addr().unwrap()).await.unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let SipMessage::Request(request) = parse(&buf[..len]).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(request.call_id().as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn close_stops_loop_and_sends() {
        let (transport, mut events) = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None).await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.is_closed());

        let closed = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        assert!(matches!(closed, Some(TransportEvent::Closed)));

        let err = transport.send_message(&options(), "127.0.0.1:9".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, SipProxyError::TransportSend { .. }));
    }
}
