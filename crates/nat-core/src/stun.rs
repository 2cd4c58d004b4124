//! Minimal RFC 5389 codec: Binding requests out, Binding responses in.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;

use crate::error::{Error, Result};

/// Fixed STUN header length
pub const STUN_HEADER_SIZE: usize = 20;

/// Magic cookie carried in every RFC 5389 message
pub const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// STUN message types understood by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    BindingRequest,
    BindingResponse,
    BindingErrorResponse,
    /// Anything else, kept raw
    Other(u16),
}

impl StunMessageType {
    pub fn to_u16(self) -> u16 {
        match self {
            Self::BindingRequest => 0x0001,
            Self::BindingResponse => 0x0101,
            Self::BindingErrorResponse => 0x0111,
            Self::Other(raw) => raw,
        }
    }

    pub fn from_u16(value: u16) -> Self {
        match value {
            0x0001 => Self::BindingRequest,
            0x0101 => Self::BindingResponse,
            0x0111 => Self::BindingErrorResponse,
            raw => Self::Other(raw),
        }
    }
}

/// Attribute types relevant to address discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunAttributeType {
    MappedAddress,
    ErrorCode,
    XorMappedAddress,
    Software,
    Fingerprint,
    Unknown(u16),
}

impl From<u16> for StunAttributeType {
    fn from(value: u16) -> Self {
        match value {
            0x0001 => Self::MappedAddress,
            0x0009 => Self::ErrorCode,
            0x0020 => Self::XorMappedAddress,
            0x8022 => Self::Software,
            0x8028 => Self::Fingerprint,
            other => Self::Unknown(other),
        }
    }
}

impl From<StunAttributeType> for u16 {
    fn from(value: StunAttributeType) -> Self {
        match value {
            StunAttributeType::MappedAddress => 0x0001,
            StunAttributeType::ErrorCode => 0x0009,
            StunAttributeType::XorMappedAddress => 0x0020,
            StunAttributeType::Software => 0x8022,
            StunAttributeType::Fingerprint => 0x8028,
            StunAttributeType::Unknown(other) => other,
        }
    }
}

/// A single TLV attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunAttribute {
    pub attr_type: StunAttributeType,
    pub value: Bytes,
}

impl StunAttribute {
    pub fn new(attr_type: StunAttributeType, value: Bytes) -> Self {
        Self { attr_type, value }
    }

    /// Build a MAPPED-ADDRESS attribute (plain, not XORed)
    pub fn mapped_address(addr: SocketAddr) -> Self {
        let mut buf = BytesMut::with_capacity(20);
        buf.put_u8(0);
        match addr.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(FAMILY_IPV4);
                buf.put_u16(addr.port());
                buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(FAMILY_IPV6);
                buf.put_u16(addr.port());
                buf.put_slice(&ip.octets());
            }
        }
        Self::new(StunAttributeType::MappedAddress, buf.freeze())
    }

    /// Build an XOR-MAPPED-ADDRESS attribute for `transaction_id`
    pub fn xor_mapped_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Self {
        let mut buf = BytesMut::with_capacity(20);
        buf.put_u8(0);
        let port = addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16;
        match addr.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(FAMILY_IPV4);
                buf.put_u16(port);
                buf.put_u32(u32::from(ip) ^ STUN_MAGIC_COOKIE);
            }
            IpAddr::V6(ip) => {
                buf.put_u8(FAMILY_IPV6);
                buf.put_u16(port);
                let key = xor_key(transaction_id);
                let mut octets = ip.octets();
                for (byte, k) in octets.iter_mut().zip(key.iter()) {
                    *byte ^= k;
                }
                buf.put_slice(&octets);
            }
        }
        Self::new(StunAttributeType::XorMappedAddress, buf.freeze())
    }

    /// Decode this attribute as a plain MAPPED-ADDRESS
    pub fn get_mapped_address(&self) -> Result<SocketAddr> {
        let (family, port, mut raw) = self.address_header()?;
        let ip = match family {
            FAMILY_IPV4 => IpAddr::V4(Ipv4Addr::from(raw.get_u32())),
            FAMILY_IPV6 => {
                let mut octets = [0u8; 16];
                raw.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => return Err(Error::StunError(format!("Unsupported address family: {}", other))),
        };
        Ok(SocketAddr::new(ip, port))
    }

    /// Decode this attribute as an XOR-MAPPED-ADDRESS
    pub fn get_xor_mapped_address(&self, transaction_id: &[u8; 12]) -> Result<SocketAddr> {
        let (family, xor_port, mut raw) = self.address_header()?;
        let port = xor_port ^ (STUN_MAGIC_COOKIE >> 16) as u16;
        let ip = match family {
            FAMILY_IPV4 => IpAddr::V4(Ipv4Addr::from(raw.get_u32() ^ STUN_MAGIC_COOKIE)),
            FAMILY_IPV6 => {
                let key = xor_key(transaction_id);
                let mut octets = [0u8; 16];
                raw.copy_to_slice(&mut octets);
                for (byte, k) in octets.iter_mut().zip(key.iter()) {
                    *byte ^= k;
                }
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => return Err(Error::StunError(format!("Unsupported address family: {}", other))),
        };
        Ok(SocketAddr::new(ip, port))
    }

    fn address_header(&self) -> Result<(u8, u16, Bytes)> {
        if self.value.len() < 8 {
            return Err(Error::StunError("Address attribute too short".to_string()));
        }
        let mut value = self.value.clone();
        value.advance(1);
        let family = value.get_u8();
        let port = value.get_u16();
        let needed = if family == FAMILY_IPV6 { 16 } else { 4 };
        if value.remaining() < needed {
            return Err(Error::StunError("Truncated address attribute".to_string()));
        }
        Ok((family, port, value))
    }
}

fn xor_key(transaction_id: &[u8; 12]) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);
    key
}

/// A decoded or to-be-encoded STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub msg_type: StunMessageType,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create a message with a random 96-bit transaction id
    pub fn new(msg_type: StunMessageType) -> Self {
        let mut transaction_id = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut transaction_id);
        Self {
            msg_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn binding_request() -> Self {
        Self::new(StunMessageType::BindingRequest)
    }

    /// Response answering `request`, reusing its transaction id
    pub fn binding_response_to(request: &StunMessage) -> Self {
        Self {
            msg_type: StunMessageType::BindingResponse,
            transaction_id: request.transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn add_attribute(&mut self, attr: StunAttribute) -> &mut Self {
        self.attributes.push(attr);
        self
    }

    pub fn encode(&self) -> Bytes {
        let body_len: usize = self
            .attributes
            .iter()
            .map(|attr| 4 + attr.value.len() + padding(attr.value.len()))
            .sum();

        let mut buf = BytesMut::with_capacity(STUN_HEADER_SIZE + body_len);
        buf.put_u16(self.msg_type.to_u16());
        buf.put_u16(0);
        buf.put_u32(STUN_MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id);

        for attr in &self.attributes {
            buf.put_u16(attr.attr_type.into());
            buf.put_u16(attr.value.len() as u16);
            buf.put_slice(&attr.value);
            buf.put_bytes(0, padding(attr.value.len()));
        }

        let msg_len = (buf.len() - STUN_HEADER_SIZE) as u16;
        BigEndian::write_u16(&mut buf[2..4], msg_len);
        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STUN_HEADER_SIZE {
            return Err(Error::StunError("Packet too small for STUN header".to_string()));
        }
        if bytes[0] & 0xC0 != 0 {
            return Err(Error::StunError("Not a STUN message".to_string()));
        }

        let msg_type = StunMessageType::from_u16(BigEndian::read_u16(&bytes[0..2]));
        let msg_len = BigEndian::read_u16(&bytes[2..4]) as usize;
        if BigEndian::read_u32(&bytes[4..8]) != STUN_MAGIC_COOKIE {
            return Err(Error::StunError("Invalid STUN magic cookie".to_string()));
        }
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..STUN_HEADER_SIZE]);

        let end = STUN_HEADER_SIZE + msg_len;
        if bytes.len() < end {
            return Err(Error::StunError("Packet too small for STUN attributes".to_string()));
        }

        let mut attributes = Vec::new();
        let mut offset = STUN_HEADER_SIZE;
        while offset + 4 <= end {
            let attr_type = BigEndian::read_u16(&bytes[offset..offset + 2]);
            let attr_len = BigEndian::read_u16(&bytes[offset + 2..offset + 4]) as usize;
            offset += 4;
            if offset + attr_len > end {
                return Err(Error::StunError("Incomplete STUN attribute value".to_string()));
            }
            attributes.push(StunAttribute::new(
                attr_type.into(),
                Bytes::copy_from_slice(&bytes[offset..offset + attr_len]),
            ));
            offset += attr_len + padding(attr_len);
        }

        Ok(Self {
            msg_type,
            transaction_id,
            attributes,
        })
    }

    pub fn get_attribute(&self, attr_type: StunAttributeType) -> Option<&StunAttribute> {
        self.attributes.iter().find(|attr| attr.attr_type == attr_type)
    }

    /// Reflexive address from XOR-MAPPED-ADDRESS, falling back to MAPPED-ADDRESS
    pub fn mapped_address(&self) -> Result<SocketAddr> {
        if let Some(attr) = self.get_attribute(StunAttributeType::XorMappedAddress) {
            return attr.get_xor_mapped_address(&self.transaction_id);
        }
        if let Some(attr) = self.get_attribute(StunAttributeType::MappedAddress) {
            return attr.get_mapped_address();
        }
        Err(Error::StunError("Response carries no mapped address".to_string()))
    }
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}
