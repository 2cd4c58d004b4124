//! Per-call relay state shared between the proxy and its forwarders.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Where SIP-bound packets go
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
    pub addr: SocketAddr,
}

/// Arrival timing of one relay direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DirectionTiming {
    pub first_packet_time: Option<DateTime<Utc>>,
    pub last_packet_time: Option<DateTime<Utc>>,
    /// Milliseconds from stream creation to the first packet
    pub setup_latency_ms: Option<u64>,
    /// Largest gap between consecutive packets, in milliseconds
    pub max_interval_ms: u64,
    /// Mean gap between consecutive packets, in microseconds
    pub mean_interval_us: u64,
    #[serde(skip)]
    intervals: u64,
    #[serde(skip)]
    total_interval_us: u64,
}

impl DirectionTiming {
    fn record(&mut self, created_at: DateTime<Utc>, now: DateTime<Utc>) {
        match self.last_packet_time {
            None => {
                self.first_packet_time = Some(now);
                self.setup_latency_ms = Some(millis(now - created_at));
            }
            Some(previous) => {
                let gap = now - previous;
                let gap_us = gap.num_microseconds().unwrap_or(i64::MAX).max(0) as u64;
                self.max_interval_ms = self.max_interval_ms.max(millis(gap));
                self.intervals += 1;
                self.total_interval_us = self.total_interval_us.saturating_add(gap_us);
                self.mean_interval_us = self.total_interval_us / self.intervals;
            }
        }
        self.last_packet_time = Some(now);
    }
}

fn millis(delta: chrono::TimeDelta) -> u64 {
    delta.num_milliseconds().max(0) as u64
}

/// Snapshot of a stream's counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub call_id: String,
    pub whatsapp_port: u16,
    pub sip_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub whatsapp_peer: Option<SocketAddr>,
    pub packets_to_sip: u64,
    pub bytes_to_sip: u64,
    pub packets_to_whatsapp: u64,
    pub bytes_to_whatsapp: u64,
    pub last_packet_time: Option<DateTime<Utc>>,
    pub to_sip_timing: DirectionTiming,
    pub to_whatsapp_timing: DirectionTiming,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

pub struct RtpStream {
    call_id: String,
    whatsapp_port: u16,
    sip_port: u16,
    remote: RwLock<RemoteEndpoint>,
    whatsapp_peer: Mutex<Option<SocketAddr>>,
    active: AtomicBool,
    cancel: CancellationToken,
    created_at: DateTime<Utc>,
    last_packet_time: Mutex<Option<DateTime<Utc>>>,
    to_sip_timing: Mutex<DirectionTiming>,
    to_whatsapp_timing: Mutex<DirectionTiming>,
    packets_to_sip: AtomicU64,
    bytes_to_sip: AtomicU64,
    packets_to_whatsapp: AtomicU64,
    bytes_to_whatsapp: AtomicU64,
}

impl RtpStream {
    pub(crate) fn new(call_id: String, whatsapp_port: u16, sip_port: u16, remote: RemoteEndpoint) -> Self {
        Self {
            call_id,
            whatsapp_port,
            sip_port,
            remote: RwLock::new(remote),
            whatsapp_peer: Mutex::new(None),
            active: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            created_at: Utc::now(),
            last_packet_time: Mutex::new(None),
            to_sip_timing: Mutex::new(DirectionTiming::default()),
            to_whatsapp_timing: Mutex::new(DirectionTiming::default()),
            packets_to_sip: AtomicU64::new(0),
            bytes_to_sip: AtomicU64::new(0),
            packets_to_whatsapp: AtomicU64::new(0),
            bytes_to_whatsapp: AtomicU64::new(0),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Port the WhatsApp side sends to
    pub fn whatsapp_port(&self) -> u16 {
        self.whatsapp_port
    }

    /// Port facing the SIP server
    pub fn sip_port(&self) -> u16 {
        self.sip_port
    }

    pub fn remote(&self) -> RemoteEndpoint {
        self.remote.read().clone()
    }

    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.remote.read().addr
    }

    pub(crate) fn set_remote(&self, remote: RemoteEndpoint) {
        *self.remote.write() = remote;
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Flip `active` off and wake both forwarders. Returns false if already stopped.
    pub(crate) fn deactivate(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        if was_active {
            self.cancel.cancel();
        }
        was_active
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Source of the first WhatsApp packet, the only destination for SIP-side audio
    pub fn whatsapp_peer(&self) -> Option<SocketAddr> {
        *self.whatsapp_peer.lock()
    }

    pub(crate) fn learn_whatsapp_peer(&self, source: SocketAddr) {
        let mut peer = self.whatsapp_peer.lock();
        if peer.is_none() {
            debug!(call_id = %self.call_id, "WhatsApp RTP peer is {}", source);
            *peer = Some(source);
        }
    }

    pub(crate) fn record_to_sip(&self, len: usize) {
        self.record_to_sip_at(len, Utc::now());
    }

    pub(crate) fn record_to_whatsapp(&self, len: usize) {
        self.record_to_whatsapp_at(len, Utc::now());
    }

    fn record_to_sip_at(&self, len: usize, now: DateTime<Utc>) {
        self.packets_to_sip.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_sip.fetch_add(len as u64, Ordering::Relaxed);
        self.to_sip_timing.lock().record(self.created_at, now);
        *self.last_packet_time.lock() = Some(now);
    }

    fn record_to_whatsapp_at(&self, len: usize, now: DateTime<Utc>) {
        self.packets_to_whatsapp.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_whatsapp.fetch_add(len as u64, Ordering::Relaxed);
        self.to_whatsapp_timing.lock().record(self.created_at, now);
        *self.last_packet_time.lock() = Some(now);
    }

    /// Packets relayed from WhatsApp towards the SIP server
    pub fn packets(&self) -> u64 {
        self.packets_to_sip.load(Ordering::Relaxed)
    }

    /// Bytes relayed from WhatsApp towards the SIP server
    pub fn bytes(&self) -> u64 {
        self.bytes_to_sip.load(Ordering::Relaxed)
    }

    pub fn last_packet_time(&self) -> Option<DateTime<Utc>> {
        *self.last_packet_time.lock()
    }

    pub fn stats(&self) -> StreamStats {
        let remote = self.remote();
        StreamStats {
            call_id: self.call_id.clone(),
            whatsapp_port: self.whatsapp_port,
            sip_port: self.sip_port,
            remote_host: remote.host,
            remote_port: remote.port,
            whatsapp_peer: self.whatsapp_peer(),
            packets_to_sip: self.packets(),
            bytes_to_sip: self.bytes(),
            packets_to_whatsapp: self.packets_to_whatsapp.load(Ordering::Relaxed),
            bytes_to_whatsapp: self.bytes_to_whatsapp.load(Ordering::Relaxed),
            last_packet_time: self.last_packet_time(),
            to_sip_timing: *self.to_sip_timing.lock(),
            to_whatsapp_timing: *self.to_whatsapp_timing.lock(),
            created_at: self.created_at,
            active: self.is_active(),
        }
    }
}

impl std::fmt::Debug for RtpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpStream")
            .field("call_id", &self.call_id)
            .field("whatsapp_port", &self.whatsapp_port)
            .field("sip_port", &self.sip_port)
            .field("remote", &*self.remote.read())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> RtpStream {
        RtpStream::new(
            "call-1".to_string(),
            10000,
            10002,
            RemoteEndpoint {
                host: "198.51.100.7".to_string(),
                port: 5004,
                addr: "198.51.100.7:5004".parse().unwrap(),
            },
        )
    }

    #[test]
    fn deactivates_once() {
        let stream = stream();
        assert!(stream.is_active());
        assert!(stream.deactivate());
        assert!(!stream.deactivate());
        assert!(!stream.is_active());
        assert!(stream.cancellation().is_cancelled());
    }

    #[test]
    fn first_whatsapp_peer_sticks() {
        let stream = stream();
        stream.learn_whatsapp_peer("192.0.2.9:40000".parse().unwrap());
        stream.learn_whatsapp_peer("192.0.2.10:40002".parse().unwrap());
        assert_eq!(stream.whatsapp_peer(), Some("192.0.2.9:40000".parse().unwrap()));
    }

    #[test]
    fn counters_accumulate() {
        let stream = stream();
        assert!(stream.last_packet_time().is_none());
        stream.record_to_sip(160);
        stream.record_to_sip(160);
        stream.record_to_whatsapp(172);

        let stats = stream.stats();
        assert_eq!(stats.packets_to_sip, 2);
        assert_eq!(stats.bytes_to_sip, 320);
        assert_eq!(stats.packets_to_whatsapp, 1);
        assert_eq!(stats.bytes_to_whatsapp, 172);
        assert!(stats.last_packet_time.is_some());
    }

    #[test]
    fn timing_tracks_gaps_per_direction() {
        let stream = stream();
        let start = stream.created_at;
        stream.record_to_sip_at(160, start + chrono::TimeDelta::milliseconds(150));
        stream.record_to_sip_at(160, start + chrono::TimeDelta::milliseconds(170));
        stream.record_to_sip_at(160, start + chrono::TimeDelta::milliseconds(230));

        let stats = stream.stats();
        let timing = stats.to_sip_timing;
        assert_eq!(timing.setup_latency_ms, Some(150));
        assert_eq!(timing.first_packet_time, Some(start + chrono::TimeDelta::milliseconds(150)));
        assert_eq!(timing.last_packet_time, Some(start + chrono::TimeDelta::milliseconds(230)));
        assert_eq!(timing.max_interval_ms, 60);
        assert_eq!(timing.mean_interval_us, 40_000);
        assert_eq!(stats.to_whatsapp_timing, DirectionTiming::default());

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["to_sip_timing"]["max_interval_ms"], 60);
        assert!(json["to_sip_timing"].get("intervals").is_none());
    }
}
