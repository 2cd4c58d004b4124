//! SIP message handling on top of `rsip`.
//!
//! One UDP datagram carries one message. `rsip` does the tokenizing; this
//! module adds compact header expansion and the few dialog fields the proxy
//! reads to route responses by Call-ID and answer mid-dialog requests.

use std::mem;

use rsip::headers::{
    CallId, Contact, ContentEncoding, ContentLength, ContentType, From as FromHeader, Subject, Supported,
    To as ToHeader, ToTypedHeader, UntypedHeader, Via,
};
use rsip::message::headers_ext::HeadersExt;

pub use rsip::{Header, Headers, Method, Param, StatusCode, StatusCodeKind, Uri, Version};
pub use rsip::{Request as SipRequest, Response as SipResponse, SipMessage};

use crate::error::{Result, SipProxyError};

/// Parse one datagram
pub fn parse(data: &[u8]) -> Result<SipMessage> {
    let text = std::str::from_utf8(data).map_err(|_| SipProxyError::parse("datagram is not UTF-8"))?;
    let text = text.trim_start_matches(['\r', '\n']);
    if text.is_empty() {
        return Err(SipProxyError::parse("empty datagram"));
    }

    let mut message = SipMessage::try_from(text).map_err(|e| SipProxyError::parse(e.to_string()))?;
    match &mut message {
        SipMessage::Request(request) => expand_compact_headers(&mut request.headers),
        SipMessage::Response(response) => expand_compact_headers(&mut response.headers),
    }
    Ok(message)
}

pub fn to_bytes(message: &SipMessage) -> Vec<u8> {
    message.to_string().into_bytes()
}

/// Rewrite single-letter header names (RFC 3261 §7.3.3) into their typed forms
fn expand_compact_headers(headers: &mut Headers) {
    let mut collected: Vec<Header> = mem::take(headers).into();
    for header in collected.iter_mut() {
        if let Header::Other(name, value) = header {
            if let Some(expanded) = expand_compact_header(name, value) {
                *header = expanded;
            }
        }
    }
    *headers = collected.into();
}

fn expand_compact_header(name: &str, value: &str) -> Option<Header> {
    let value = value.trim().to_string();
    match name.trim().to_ascii_lowercase().as_str() {
        "i" => Some(Header::CallId(CallId::new(value))),
        "f" => Some(Header::From(FromHeader::new(value))),
        "t" => Some(Header::To(ToHeader::new(value))),
        "v" => Some(Header::Via(Via::new(value))),
        "m" => Some(Header::Contact(Contact::new(value))),
        "l" => Some(Header::ContentLength(ContentLength::new(value))),
        "c" => Some(Header::ContentType(ContentType::new(value))),
        "e" => Some(Header::ContentEncoding(ContentEncoding::new(value))),
        "k" => Some(Header::Supported(Supported::new(value))),
        "s" => Some(Header::Subject(Subject::new(value))),
        _ => None,
    }
}

/// Dialog identifiers read from either kind of message
pub trait DialogHeaders: HeadersExt {
    fn call_id(&self) -> Option<String> {
        let value = self.call_id_header().ok()?.value().trim().to_string();
        (!value.is_empty()).then_some(value)
    }

    /// CSeq sequence number and method
    fn cseq(&self) -> Option<(u32, Method)> {
        let cseq = self.cseq_header().ok()?.typed().ok()?;
        Some((cseq.seq, cseq.method))
    }

    fn from_tag(&self) -> Option<String> {
        let tag = self.from_header().ok()?.tag().ok().flatten()?;
        Some(tag.value().to_string())
    }

    fn to_tag(&self) -> Option<String> {
        let tag = self.to_header().ok()?.tag().ok().flatten()?;
        Some(tag.value().to_string())
    }

    /// Raw To value, tag included
    fn to_value(&self) -> Option<String> {
        self.to_header().ok().map(|to| to.value().to_string())
    }

    /// branch parameter of the top Via
    fn via_branch(&self) -> Option<String> {
        let via = self.via_header().ok()?.typed().ok()?;
        via.params.iter().find_map(|param| match param {
            Param::Branch(branch) => Some(branch.value().to_string()),
            _ => None,
        })
    }

    /// URI of the first Contact header
    fn contact_uri(&self) -> Option<Uri> {
        self.contact_header().ok()?.typed().ok().map(|contact| contact.uri)
    }
}

impl DialogHeaders for SipRequest {}
impl DialogHeaders for SipResponse {}

/// Status line accessors
pub trait ResponseExt {
    fn status(&self) -> u16;

    /// Reason phrase of the status line
    fn reason(&self) -> String;

    fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status())
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status())
    }

    fn is_final(&self) -> bool {
        self.status() >= 200
    }
}

impl ResponseExt for SipResponse {
    fn status(&self) -> u16 {
        self.status_code.code()
    }

    fn reason(&self) -> String {
        let line = self.status_code.to_string();
        match line.split_once(' ') {
            Some((_, reason)) => reason.trim().to_string(),
            None => String::new(),
        }
    }
}

/// Response that never went over the wire, e.g. a local 408
pub fn synthetic_response(status: u16, call_id: &str) -> SipResponse {
    let headers: Headers = vec![
        Header::CallId(CallId::new(call_id)),
        Header::ContentLength(ContentLength::new("0")),
    ]
    .into();
    SipResponse {
        status_code: StatusCode::from(status),
        version: Version::V2,
        headers,
        body: Vec::new(),
    }
}

pub fn body_text(body: &[u8]) -> &str {
    std::str::from_utf8(body).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RINGING: &str = "SIP/2.0 180 Ringing\r\n\
        Via: SIP/2.0/UDP 10.0.0.2:40000;rport=40000;branch=z9hG4bK0123456789abcdef\r\n\
        From: <sip:5511999990000@203.0.113.5:40000>;tag=a1b2c3d4e5f60718\r\n\
        To: <sip:5511888880000@voip.example.com:26499>;tag=srv-1\r\n\
        Call-ID: CID-A\r\n\
        CSeq: 1 INVITE\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn parses_response() {
        let SipMessage::Response(response) = parse(RINGING.as_bytes()).unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(response.status(), 180);
        assert!(response.is_provisional());
        assert!(!response.is_final());
        assert_eq!(response.call_id().as_deref(), Some("CID-A"));
        assert_eq!(response.cseq(), Some((1, Method::Invite)));
        assert_eq!(response.from_tag().as_deref(), Some("a1b2c3d4e5f60718"));
        assert_eq!(response.to_tag().as_deref(), Some("srv-1"));
        assert_eq!(response.via_branch().as_deref(), Some("z9hG4bK0123456789abcdef"));
    }

    #[test]
    fn parses_request_with_compact_headers() {
        let raw = "BYE sip:5511999990000@10.0.0.2:40000 SIP/2.0\r\n\
            v: SIP/2.0/UDP 198.51.100.1:26499;branch=z9hG4bKsrv\r\n\
            f: <sip:5511888880000@voip.example.com>;tag=srv-1\r\n\
            t: <sip:5511999990000@203.0.113.5>;tag=a1b2\r\n\
            i: CID-A\r\n\
            CSeq: 5 BYE\r\n\
            l: 0\r\n\r\n";
        let SipMessage::Request(request) = parse(raw.as_bytes()).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(request.method, Method::Bye);
        assert_eq!(request.uri.to_string(), "sip:5511999990000@10.0.0.2:40000");
        assert_eq!(request.call_id().as_deref(), Some("CID-A"));
        assert_eq!(request.to_tag().as_deref(), Some("a1b2"));
        assert_eq!(request.from_tag().as_deref(), Some("srv-1"));
        assert_eq!(request.via_branch().as_deref(), Some("z9hG4bKsrv"));
        assert_eq!(request.cseq(), Some((5, Method::Bye)));
    }

    #[test]
    fn rejects_non_sip_payloads() {
        assert!(parse(b"").is_err());
        assert!(parse(b"\r\n\r\n").is_err());
        assert!(parse(b"hello world").is_err());
        assert!(parse(&[0xff, 0xfe, 0x00]).is_err());
    }

    #[test]
    fn synthetic_response_carries_call_id() {
        let response = synthetic_response(408, "CID-T");
        assert_eq!(response.status(), 408);
        assert!(response.is_final());
        assert!(!response.is_success());
        assert_eq!(response.call_id().as_deref(), Some("CID-T"));
        assert!(response.body.is_empty());
    }

    #[test]
    fn reason_comes_from_status_line() {
        let SipMessage::Response(response) = parse(RINGING.as_bytes()).unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(response.reason(), "Ringing");
    }
}
