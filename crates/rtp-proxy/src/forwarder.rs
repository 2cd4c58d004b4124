//! The two relay loops run for every stream.
//!
//! Datagrams are copied verbatim; nothing in the RTP header or payload is
//! inspected. Each direction ends on its own when it hits a non-timeout
//! socket error, leaving the other direction untouched.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, error, trace};

use crate::error::{Direction, Error};
use crate::stream::RtpStream;

/// Tuning knobs for the relay loops
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Receive buffer, one MTU
    pub max_packet_size: usize,
    /// Read deadline on the WhatsApp side, refreshed by every packet
    pub whatsapp_idle_timeout: Duration,
    /// Read deadline on the SIP side; the loop re-checks `active` after each
    pub sip_read_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 1500,
            whatsapp_idle_timeout: Duration::from_secs(30),
            sip_read_timeout: Duration::from_secs(1),
        }
    }
}

enum Received {
    Packet(usize, std::net::SocketAddr),
    Idle,
    Stopped,
    Failed(io::Error),
}

async fn receive(stream: &RtpStream, socket: &UdpSocket, buf: &mut [u8], deadline: Duration) -> Received {
    let cancel = stream.cancellation();
    tokio::select! {
        _ = cancel.cancelled() => Received::Stopped,
        result = timeout(deadline, socket.recv_from(buf)) => match result {
            Err(_) => Received::Idle,
            Ok(Ok((len, source))) => Received::Packet(len, source),
            Ok(Err(e)) => Received::Failed(e),
        },
    }
}

/// WhatsApp → SIP: learns the WhatsApp peer and pushes packets to the remote endpoint
pub(crate) async fn whatsapp_to_sip(
    stream: Arc<RtpStream>,
    whatsapp: Arc<UdpSocket>,
    sip: Arc<UdpSocket>,
    config: ForwarderConfig,
) {
    let direction = Direction::WhatsAppToSip;
    let mut buf = vec![0u8; config.max_packet_size];

    while stream.is_active() {
        let (len, source) = match receive(&stream, &whatsapp, &mut buf, config.whatsapp_idle_timeout).await {
            Received::Packet(len, source) => (len, source),
            Received::Idle => {
                debug!(call_id = %stream.call_id(), "No WhatsApp RTP for {:?}", config.whatsapp_idle_timeout);
                continue;
            }
            Received::Stopped => break,
            Received::Failed(e) => {
                report(&stream, Error::forwarder(direction, e.to_string()));
                break;
            }
        };

        stream.learn_whatsapp_peer(source);
        let target = stream.remote_addr();
        if let Err(e) = sip.send_to(&buf[..len], target).await {
            report(&stream, Error::forwarder(direction, format!("send to {}: {}", target, e)));
            break;
        }
        stream.record_to_sip(len);
        trace!(call_id = %stream.call_id(), "{} bytes {} -> {}", len, source, target);
    }

    debug!(call_id = %stream.call_id(), "{} forwarder stopped", direction);
}

/// SIP → WhatsApp: only the remote endpoint is relayed, and only once the WhatsApp peer is known
pub(crate) async fn sip_to_whatsapp(
    stream: Arc<RtpStream>,
    whatsapp: Arc<UdpSocket>,
    sip: Arc<UdpSocket>,
    config: ForwarderConfig,
) {
    let direction = Direction::SipToWhatsApp;
    let mut buf = vec![0u8; config.max_packet_size];

    while stream.is_active() {
        let (len, source) = match receive(&stream, &sip, &mut buf, config.sip_read_timeout).await {
            Received::Packet(len, source) => (len, source),
            Received::Idle => continue,
            Received::Stopped => break,
            Received::Failed(e) => {
                report(&stream, Error::forwarder(direction, e.to_string()));
                break;
            }
        };

        let remote = stream.remote_addr();
        if source != remote {
            trace!(call_id = %stream.call_id(), "Dropping {} bytes from {}: expected {}", len, source, remote);
            continue;
        }
        let Some(peer) = stream.whatsapp_peer() else {
            trace!(call_id = %stream.call_id(), "Dropping {} bytes from {}: WhatsApp peer unknown", len, source);
            continue;
        };
        if let Err(e) = whatsapp.send_to(&buf[..len], peer).await {
            report(&stream, Error::forwarder(direction, format!("send to {}: {}", peer, e)));
            break;
        }
        stream.record_to_whatsapp(len);
        trace!(call_id = %stream.call_id(), "{} bytes {} -> {}", len, source, peer);
    }

    debug!(call_id = %stream.call_id(), "{} forwarder stopped", direction);
}

fn report(stream: &RtpStream, err: Error) {
    if stream.is_active() {
        error!(call_id = %stream.call_id(), "{}", err);
    }
}
