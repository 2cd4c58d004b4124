//! SIP request and response construction for the UAC side of a call.
//!
//! The proxy only ever plays the caller: it sends INVITE, ACK, BYE and
//! CANCEL, and answers in-dialog BYE/CANCEL with 200 OK.

use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use rand::rngs::OsRng;
use rsip::headers::{
    Allow, CSeq, CallId, Contact, ContentLength, ContentType, From as FromHeader, MaxForwards, To as ToHeader,
    UntypedHeader, UserAgent, Via,
};
use rsip::message::headers_ext::HeadersExt;

use crate::error::{Result, SipProxyError};
use crate::message::{DialogHeaders, Header, Headers, Method, SipRequest, SipResponse, StatusCode, Uri, Version};

/// Magic cookie every RFC 3261 branch starts with
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Port left out of URIs and Via when used
pub const IMPLICIT_SIP_PORT: u16 = 5060;

const MAX_FORWARDS: &str = "70";
const ALLOW: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS";

/// 8 random bytes from the OS RNG, hex encoded
pub fn generate_tag() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `z9hG4bK` followed by 16 hex digits mixing the clock with 64 random bits
pub fn generate_branch() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    format!("{}{:016x}", BRANCH_MAGIC_COOKIE, nanos ^ OsRng.next_u64())
}

/// `host` or `host:port`, leaving out 5060
pub fn host_port(host: &str, port: u16) -> String {
    if port == IMPLICIT_SIP_PORT {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

pub fn parse_uri(value: &str) -> Result<Uri> {
    Uri::try_from(value).map_err(|e| SipProxyError::parse(format!("invalid SIP URI '{}': {}", value, e)))
}

/// `sip:<to>@<server>[:<port>]`
pub fn request_uri(to: &str, sip_server: &str, sip_port: u16) -> Result<Uri> {
    parse_uri(&format!("sip:{}@{}", to, host_port(sip_server, sip_port)))
}

pub fn via_value(local_ip: Ipv4Addr, local_port: u16, branch: &str) -> String {
    format!(
        "SIP/2.0/UDP {};rport;branch={}",
        host_port(&local_ip.to_string(), local_port),
        branch
    )
}

/// Everything needed to write the initial INVITE of a call
#[derive(Debug, Clone)]
pub struct InviteParams<'a> {
    pub call_id: &'a str,
    pub from: &'a str,
    pub to: &'a str,
    pub local_ip: Ipv4Addr,
    pub public_ip: Ipv4Addr,
    pub local_port: u16,
    pub sip_server: &'a str,
    pub sip_port: u16,
    pub user_agent: &'a str,
    pub from_tag: &'a str,
    pub branch: &'a str,
    pub sdp: &'a str,
}

pub fn build_invite(params: &InviteParams<'_>) -> Result<SipRequest> {
    let uri = request_uri(params.to, params.sip_server, params.sip_port)?;
    let from = format!(
        "<sip:{}@{}>;tag={}",
        params.from,
        host_port(&params.public_ip.to_string(), params.local_port),
        params.from_tag
    );

    let headers: Headers = vec![
        Header::Via(Via::new(via_value(params.local_ip, params.local_port, params.branch))),
        Header::MaxForwards(MaxForwards::new(MAX_FORWARDS)),
        Header::From(FromHeader::new(from)),
        Header::To(ToHeader::new(format!("<{}>", uri))),
        Header::CallId(CallId::new(params.call_id)),
        Header::CSeq(CSeq::new(format!("1 {}", Method::Invite))),
        Header::Contact(Contact::new(format!(
            "<sip:{}@{}:{}>",
            params.from, params.local_ip, params.local_port
        ))),
        Header::UserAgent(UserAgent::new(params.user_agent)),
        Header::Allow(Allow::new(ALLOW)),
        Header::ContentType(ContentType::new("application/sdp")),
        Header::ContentLength(ContentLength::new(params.sdp.len().to_string())),
    ]
    .into();

    Ok(SipRequest {
        method: Method::Invite,
        uri,
        version: Version::V2,
        headers,
        body: params.sdp.as_bytes().to_vec(),
    })
}

/// Top Via of `invite` with its branch parameter replaced
fn rebranch(invite: &SipRequest, branch: &str) -> Option<Via> {
    let via = invite.via_header().ok()?.value();
    let mut parts: Vec<&str> = via
        .split(';')
        .filter(|p| !p.trim().to_ascii_lowercase().starts_with("branch="))
        .collect();
    let branch = format!("branch={}", branch);
    parts.push(&branch);
    Some(Via::new(parts.join(";")))
}

fn in_dialog_request(
    method: Method,
    invite: &SipRequest,
    target: Uri,
    to: &str,
    cseq: u32,
    branch: &str,
    user_agent: Option<&str>,
) -> SipRequest {
    let mut headers = Headers::default();
    if let Some(via) = rebranch(invite, branch) {
        headers.push(Header::Via(via));
    }
    headers.push(Header::MaxForwards(MaxForwards::new(MAX_FORWARDS)));
    if let Ok(from) = invite.from_header() {
        headers.push(Header::From(from.clone()));
    }
    headers.push(Header::To(ToHeader::new(to)));
    if let Ok(call_id) = invite.call_id_header() {
        headers.push(Header::CallId(call_id.clone()));
    }
    headers.push(Header::CSeq(CSeq::new(format!("{} {}", cseq, method))));
    if let Some(user_agent) = user_agent {
        headers.push(Header::UserAgent(UserAgent::new(user_agent)));
    }
    headers.push(Header::ContentLength(ContentLength::new("0")));

    SipRequest {
        method,
        uri: target,
        version: Version::V2,
        headers,
        body: Vec::new(),
    }
}

fn invite_seq(invite: &SipRequest) -> u32 {
    invite.cseq().map(|(seq, _)| seq).unwrap_or(1)
}

/// Remote target: the 2xx Contact if present, else the INVITE Request-URI
pub fn remote_target(invite: &SipRequest, response: &SipResponse) -> Uri {
    response.contact_uri().unwrap_or_else(|| invite.uri.clone())
}

/// ACK for a 2xx: new transaction, To carries the remote tag
pub fn build_ack(invite: &SipRequest, response: &SipResponse) -> SipRequest {
    let to = response.to_value().or_else(|| invite.to_value()).unwrap_or_default();
    in_dialog_request(
        Method::Ack,
        invite,
        remote_target(invite, response),
        &to,
        invite_seq(invite),
        &generate_branch(),
        None,
    )
}

/// BYE for an established dialog
pub fn build_bye(invite: &SipRequest, remote_to: &str, target: Uri, user_agent: &str) -> SipRequest {
    in_dialog_request(
        Method::Bye,
        invite,
        target,
        remote_to,
        invite_seq(invite) + 1,
        &generate_branch(),
        Some(user_agent),
    )
}

/// CANCEL matching the INVITE transaction: same branch, Request-URI, To and CSeq number
pub fn build_cancel(invite: &SipRequest, user_agent: &str) -> SipRequest {
    let branch = invite.via_branch().unwrap_or_default();
    let to = invite.to_value().unwrap_or_default();
    in_dialog_request(
        Method::Cancel,
        invite,
        invite.uri.clone(),
        &to,
        invite_seq(invite),
        &branch,
        Some(user_agent),
    )
}

/// Response to `request` echoing Via, From, To, Call-ID and CSeq
pub fn build_response(request: &SipRequest, status: u16, user_agent: &str) -> SipResponse {
    let mut headers = Headers::default();
    for header in request.headers.iter() {
        match header {
            Header::Via(_) | Header::From(_) | Header::To(_) | Header::CallId(_) | Header::CSeq(_) => {
                headers.push(header.clone())
            }
            _ => {}
        }
    }
    headers.push(Header::UserAgent(UserAgent::new(user_agent)));
    headers.push(Header::ContentLength(ContentLength::new("0")));

    SipResponse {
        status_code: StatusCode::from(status),
        version: Version::V2,
        headers,
        body: Vec::new(),
    }
}

/// User part of a SIP URI (`sip:user@host` -> `user`)
pub fn uri_user(uri: &Uri) -> Option<&str> {
    uri.auth.as_ref().map(|auth| auth.user.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ResponseExt, SipMessage, parse};

    fn params<'a>(local_port: u16, sip_port: u16) -> InviteParams<'a> {
        InviteParams {
            call_id: "CID-A",
            from: "5511999990000",
            to: "5511888880000",
            local_ip: Ipv4Addr::new(10, 0, 0, 2),
            public_ip: Ipv4Addr::new(203, 0, 113, 5),
            local_port,
            sip_server: "voip.example.com",
            sip_port,
            user_agent: "QuePasa-SIPProxy/1.0",
            from_tag: "0011223344556677",
            branch: "z9hG4bK00000000deadbeef",
            sdp: "v=0\r\n",
        }
    }

    fn header_value(request: &SipRequest, name: &str) -> Option<String> {
        request.to_string().lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim().to_string())
        })
    }

    #[test]
    fn tags_are_16_hex_and_unique() {
        let a = generate_tag();
        let b = generate_tag();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn branches_carry_magic_cookie() {
        let branch = generate_branch();
        assert!(branch.starts_with("z9hG4bK"));
        assert_eq!(branch.len(), 7 + 16);
        assert_ne!(branch, generate_branch());
    }

    #[test]
    fn invite_headers_with_explicit_ports() {
        let invite = build_invite(&params(40000, 26499)).unwrap();
        assert_eq!(invite.uri.to_string(), "sip:5511888880000@voip.example.com:26499");
        assert_eq!(
            header_value(&invite, "Via").as_deref(),
            Some("SIP/2.0/UDP 10.0.0.2:40000;rport;branch=z9hG4bK00000000deadbeef")
        );
        assert_eq!(
            header_value(&invite, "From").as_deref(),
            Some("<sip:5511999990000@203.0.113.5:40000>;tag=0011223344556677")
        );
        assert_eq!(header_value(&invite, "Contact").as_deref(), Some("<sip:5511999990000@10.0.0.2:40000>"));
        assert_eq!(invite.to_value().as_deref(), Some("<sip:5511888880000@voip.example.com:26499>"));
        assert_eq!(invite.call_id().as_deref(), Some("CID-A"));
        assert_eq!(invite.from_tag().as_deref(), Some("0011223344556677"));
        assert_eq!(invite.via_branch().as_deref(), Some("z9hG4bK00000000deadbeef"));
        assert_eq!(header_value(&invite, "User-Agent").as_deref(), Some("QuePasa-SIPProxy/1.0"));
        assert_eq!(header_value(&invite, "Content-Length").as_deref(), Some("5"));
        assert_eq!(invite.body, b"v=0\r\n");
    }

    #[test]
    fn invite_omits_default_port() {
        let invite = build_invite(&params(IMPLICIT_SIP_PORT, IMPLICIT_SIP_PORT)).unwrap();
        assert_eq!(invite.uri.to_string(), "sip:5511888880000@voip.example.com");
        assert_eq!(
            header_value(&invite, "Via").as_deref(),
            Some("SIP/2.0/UDP 10.0.0.2;rport;branch=z9hG4bK00000000deadbeef")
        );
        assert_eq!(
            header_value(&invite, "From").as_deref(),
            Some("<sip:5511999990000@203.0.113.5>;tag=0011223344556677")
        );
        // Contact always carries the port
        assert_eq!(header_value(&invite, "Contact").as_deref(), Some("<sip:5511999990000@10.0.0.2:5060>"));
    }

    #[test]
    fn invite_survives_the_wire() {
        let invite = build_invite(&params(40000, 26499)).unwrap();
        let SipMessage::Request(parsed) = parse(invite.to_string().as_bytes()).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(parsed.method, Method::Invite);
        assert_eq!(parsed.cseq(), Some((1, Method::Invite)));
        assert_eq!(parsed.via_branch(), invite.via_branch());
    }

    fn ok_response() -> SipResponse {
        let raw = "SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/UDP 10.0.0.2:40000;rport=40000;branch=z9hG4bK00000000deadbeef\r\n\
            From: <sip:5511999990000@203.0.113.5:40000>;tag=0011223344556677\r\n\
            To: <sip:5511888880000@voip.example.com:26499>;tag=remote-9\r\n\
            Call-ID: CID-A\r\n\
            CSeq: 1 INVITE\r\n\
            Contact: <sip:5511888880000@198.51.100.1:26499>\r\n\
            Content-Length: 0\r\n\r\n";
        match parse(raw.as_bytes()).unwrap() {
            SipMessage::Response(r) => r,
            _ => unreachable!(),
        }
    }

    #[test]
    fn ack_targets_contact_with_remote_tag() {
        let invite = build_invite(&params(40000, 26499)).unwrap();
        let ack = build_ack(&invite, &ok_response());

        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.uri.to_string(), "sip:5511888880000@198.51.100.1:26499");
        assert_eq!(ack.to_tag().as_deref(), Some("remote-9"));
        assert_eq!(ack.from_tag().as_deref(), Some("0011223344556677"));
        assert_eq!(ack.cseq(), Some((1, Method::Ack)));
        assert_eq!(ack.call_id().as_deref(), Some("CID-A"));
        let branch = ack.via_branch().unwrap();
        assert!(branch.starts_with("z9hG4bK"));
        assert_ne!(branch, "z9hG4bK00000000deadbeef");
    }

    #[test]
    fn bye_increments_cseq() {
        let invite = build_invite(&params(40000, 26499)).unwrap();
        let response = ok_response();
        let bye = build_bye(
            &invite,
            &response.to_value().unwrap(),
            remote_target(&invite, &response),
            "UA",
        );
        assert_eq!(bye.method, Method::Bye);
        assert_eq!(bye.cseq(), Some((2, Method::Bye)));
        assert_eq!(bye.to_tag().as_deref(), Some("remote-9"));
        assert_eq!(bye.uri.to_string(), "sip:5511888880000@198.51.100.1:26499");
    }

    #[test]
    fn cancel_reuses_invite_transaction() {
        let invite = build_invite(&params(40000, 26499)).unwrap();
        let cancel = build_cancel(&invite, "UA");
        assert_eq!(cancel.uri, invite.uri);
        assert_eq!(cancel.via_branch().as_deref(), Some("z9hG4bK00000000deadbeef"));
        assert_eq!(cancel.cseq(), Some((1, Method::Cancel)));
        assert_eq!(cancel.to_tag(), None);
    }

    #[test]
    fn response_echoes_dialog_headers() {
        let raw = "BYE sip:a@10.0.0.2:40000 SIP/2.0\r\n\
            Via: SIP/2.0/UDP 198.51.100.1:26499;branch=z9hG4bKsrv\r\n\
            Via: SIP/2.0/UDP 198.51.100.9;branch=z9hG4bKedge\r\n\
            From: <sip:b@voip.example.com>;tag=remote-9\r\n\
            To: <sip:a@203.0.113.5>;tag=0011223344556677\r\n\
            Call-ID: CID-A\r\n\
            CSeq: 7 BYE\r\n\
            Content-Length: 0\r\n\r\n";
        let SipMessage::Request(bye) = parse(raw.as_bytes()).unwrap() else {
            unreachable!()
        };
        let ok = build_response(&bye, 200, "UA");
        assert_eq!(ok.status(), 200);
        assert_eq!(ok.headers.iter().filter(|h| matches!(h, Header::Via(_))).count(), 2);
        assert_eq!(ok.cseq(), Some((7, Method::Bye)));
        assert_eq!(ok.to_tag().as_deref(), Some("0011223344556677"));
        assert!(ok.to_string().starts_with("SIP/2.0 200 OK\r\n"));
    }

    #[test]
    fn extracts_uri_user() {
        assert_eq!(uri_user(&parse_uri("sip:5511@voip.example.com").unwrap()), Some("5511"));
        assert_eq!(uri_user(&parse_uri("sip:voip.example.com").unwrap()), None);
    }
}
