//! Even-port selection inside the media range.

use std::collections::HashSet;
use std::net::{Ipv4Addr, UdpSocket};
use std::ops::RangeInclusive;

use tracing::trace;

use crate::error::{Error, Result};

pub const DEFAULT_MIN_PORT: u16 = 10000;
pub const DEFAULT_MAX_PORT: u16 = 20000;

/// Walks even ports of a range, skipping ports owned elsewhere
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAllocator {
    min: u16,
    max: u16,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_PORT,
            max: DEFAULT_MAX_PORT,
        }
    }
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Result<Self> {
        let (min, max) = (*range.start(), *range.end());
        if min == 0 || min > max {
            return Err(Error::InvalidPortRange(format!("{}-{}", min, max)));
        }
        let min = if min % 2 == 1 { min.saturating_add(1) } else { min };
        if min > max || min % 2 == 1 {
            return Err(Error::InvalidPortRange(format!("no even port in {}-{}", *range.start(), max)));
        }
        Ok(Self { min, max })
    }

    /// Parse "MIN-MAX"
    pub fn parse(range: &str) -> Result<Self> {
        let (min, max) = range
            .split_once('-')
            .ok_or_else(|| Error::InvalidPortRange(range.to_string()))?;
        let min = min.trim().parse::<u16>().map_err(|_| Error::InvalidPortRange(range.to_string()))?;
        let max = max.trim().parse::<u16>().map_err(|_| Error::InvalidPortRange(range.to_string()))?;
        Self::new(min..=max)
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.min..=self.max
    }

    /// Whether `port` is an even port inside the range
    pub fn accepts(&self, port: u16) -> bool {
        port % 2 == 0 && self.range().contains(&port)
    }

    fn candidates<'a>(&self, excluded: &'a HashSet<u16>) -> impl Iterator<Item = u16> + 'a {
        (self.min..=self.max)
            .step_by(2)
            .filter(move |port| !excluded.contains(port))
    }

    /// Bind the first free even port not in `excluded`
    pub fn bind_any(&self, excluded: &HashSet<u16>) -> Result<(u16, UdpSocket)> {
        for port in self.candidates(excluded) {
            match bind_exact(port) {
                Ok(socket) => return Ok((port, socket)),
                Err(_) => trace!("RTP port {} busy", port),
            }
        }
        Err(Error::bind(None, format!("no free even port in {}-{}", self.min, self.max)))
    }

    /// First even port that can currently be bound; the trial socket is closed again
    pub fn find_free(&self, excluded: &HashSet<u16>) -> Result<u16> {
        self.bind_any(excluded).map(|(port, _socket)| port)
    }
}

/// Bind `0.0.0.0:port` so peers behind NAT can reach it from any source
pub fn bind_exact(port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
        .map_err(|e| Error::bind(Some(port), format!("port {}: {}", port, e)))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ranges() {
        let allocator = PortAllocator::parse("10000-20000").unwrap();
        assert_eq!(allocator.range(), 10000..=20000);

        let odd = PortAllocator::parse("10001 - 10010").unwrap();
        assert_eq!(odd.range(), 10002..=10010);

        assert!(PortAllocator::parse("20000-10000").is_err());
        assert!(PortAllocator::parse("abc").is_err());
        assert!(PortAllocator::parse("10001-10001").is_err());
    }

    #[test]
    fn accepts_only_even_ports_in_range() {
        let allocator = PortAllocator::default();
        assert!(allocator.accepts(12000));
        assert!(!allocator.accepts(12001));
        assert!(!allocator.accepts(9998));
        assert!(!allocator.accepts(20002));
    }

    #[test]
    fn skips_excluded_and_busy_ports() {
        let allocator = PortAllocator::parse("31000-31100").unwrap();
        let (first, held) = allocator.bind_any(&HashSet::new()).unwrap();
        assert_eq!(first % 2, 0);

        let mut excluded = HashSet::new();
        excluded.insert(first);
        let (second, _socket) = allocator.bind_any(&excluded).unwrap();
        assert_ne!(first, second);
        assert_eq!(second % 2, 0);
        drop(held);
    }

    #[test]
    fn exhausted_range_is_a_bind_error() {
        let allocator = PortAllocator::parse("31200-31202").unwrap();
        let excluded: HashSet<u16> = [31200, 31202].into_iter().collect();
        let err = allocator.bind_any(&excluded).unwrap_err();
        assert!(err.is_bind_error());
    }
}
