//! End-to-end call flows against a fake SIP server on the loopback interface

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rsip::headers::{Contact, ContentLength, ContentType, To, UntypedHeader};
use rsip::prelude::HeadersExt;
use tokio::net::UdpSocket;

use quepasa_sip_proxy::builder::build_response;
use quepasa_sip_proxy::message::{Header, body_text, parse, to_bytes};
use quepasa_sip_proxy::{
    CallState, DialogHeaders, Manager, Method, ResponseExt, SipMessage, SipProxyError, SipRequest, SipResponse,
    Settings, TerminationReason,
};

const FROM: &str = "5511999990000";
const TO: &str = "5511888880000";

struct FakeSipServer {
    socket: UdpSocket,
}

impl FakeSipServer {
    async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    async fn recv(&self, within: Duration) -> Option<(SipMessage, SocketAddr)> {
        let mut buf = vec![0u8; 65535];
        let (len, source) = tokio::time::timeout(within, self.socket.recv_from(&mut buf)).await.ok()?.ok()?;
        Some((parse(&buf[..len]).unwrap(), source))
    }

    async fn expect_request(&self, method: Method) -> (SipRequest, SocketAddr) {
        match self.recv(Duration::from_secs(3)).await {
            Some((SipMessage::Request(request), source)) if request.method == method => (request, source),
            other => panic!("expected {}, got {:?}", method, other),
        }
    }

    async fn expect_response(&self) -> SipResponse {
        match self.recv(Duration::from_secs(3)).await {
            Some((SipMessage::Response(response), _)) => response,
            other => panic!("expected a response, got {:?}", other),
        }
    }

    async fn expect_silence(&self, within: Duration) {
        if let Some((message, _)) = self.recv(within).await {
            panic!("unexpected message {}", message);
        }
    }

    async fn respond(&self, invite: &SipRequest, code: u16, sdp: Option<&str>, to: SocketAddr) {
        let mut response = build_response(invite, code, "FakeSipServer");
        if code > 100 {
            let tagged = format!("{};tag=srv-1", invite.to_value().unwrap());
            response.headers.retain(|header| !matches!(header, Header::To(_)));
            response.headers.push(To::new(tagged).into());
        }
        if (200..300).contains(&code) {
            let contact = format!("<sip:{}@{}>", TO, self.addr());
            response.headers.push(Contact::new(contact).into());
        }
        if let Some(sdp) = sdp {
            response
                .headers
                .retain(|header| !matches!(header, Header::ContentLength(_)));
            response.headers.push(ContentType::new("application/sdp").into());
            response.headers.push(ContentLength::new(sdp.len().to_string()).into());
            response.body = sdp.as_bytes().to_vec();
        }
        self.send(&SipMessage::Response(response), to).await;
    }

    async fn send(&self, message: &SipMessage, to: SocketAddr) {
        self.socket.send_to(&to_bytes(message), to).await.unwrap();
    }
}

fn answer_sdp(rtp_port: u16) -> String {
    format!(
        "v=0\r\no=srv 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio {} RTP/AVP 0\r\n",
        rtp_port
    )
}

fn offered_rtp_port(invite: &SipRequest) -> u16 {
    body_text(&invite.body)
        .lines()
        .find_map(|line| line.strip_prefix("m=audio "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|port| port.parse().ok())
        .unwrap()
}

fn settings(server: SocketAddr, media_ports: &str) -> Settings {
    Settings::new("127.0.0.1", server.port())
        .with_local_ip(Ipv4Addr::LOCALHOST)
        .with_public_ip("203.0.113.5")
        .with_stun_server("")
        .with_upnp(false)
        .with_media_port_range(media_ports)
}

#[derive(Default)]
struct Events {
    accepted: Mutex<Vec<(String, u16)>>,
    rejected: Mutex<Vec<(String, u16)>>,
    terminated: Mutex<Vec<(String, TerminationReason)>>,
}

fn subscribe(manager: &Manager) -> Arc<Events> {
    let events = Arc::new(Events::default());

    let sink = events.clone();
    manager.set_call_accepted_callback(move |call_id, _from, _to, response| {
        sink.accepted.lock().push((call_id.to_string(), response.status()));
    });
    let sink = events.clone();
    manager.set_call_rejected_callback(move |call_id, _from, _to, response| {
        sink.rejected.lock().push((call_id.to_string(), response.status()));
    });
    let sink = events.clone();
    manager.set_call_terminated_callback(move |call_id, _from, _to, reason| {
        sink.terminated.lock().push((call_id.to_string(), reason));
    });
    events
}

async fn eventually(what: &str, within: Duration, check: impl Fn() -> bool) {
    let deadline = Instant::now() + within;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn accepted_call_is_acked_and_bridged() {
    let server = FakeSipServer::bind().await;
    let rtp_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let manager = Manager::new(settings(server.addr(), "35000-35100")).unwrap();
    let events = subscribe(&manager);

    manager.send_invite("CID-A", FROM, TO).await.unwrap();
    let (invite, source) = server.expect_request(Method::Invite).await;

    let local_port = manager.network_info().unwrap().local_port;
    assert_eq!(source.port(), local_port);
    assert_eq!(invite.call_id().as_deref(), Some("CID-A"));
    let from = invite.from_header().unwrap().value().to_string();
    let prefix = format!("<sip:{}@203.0.113.5:{}>;tag=", FROM, local_port);
    assert!(from.starts_with(&prefix), "From was {}", from);
    let tag = &from[prefix.len()..];
    assert_eq!(tag.len(), 16);
    assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(invite.via_branch().unwrap().starts_with("z9hG4bK"));
    assert_eq!(invite.uri.to_string(), format!("sip:{}@127.0.0.1:{}", TO, server.addr().port()));

    let offered = offered_rtp_port(&invite);
    assert_eq!(offered % 2, 0);
    assert!((35000..=35100).contains(&offered));

    server.respond(&invite, 100, None, source).await;
    server.respond(&invite, 180, None, source).await;
    eventually("Proceeding", Duration::from_secs(3), || {
        manager.call_state("CID-A") == Some(CallState::Proceeding)
    })
    .await;

    let sdp = answer_sdp(rtp_peer.local_addr().unwrap().port());
    server.respond(&invite, 200, Some(&sdp), source).await;

    let (ack, _) = server.expect_request(Method::Ack).await;
    assert_eq!(ack.call_id().as_deref(), Some("CID-A"));
    assert_eq!(ack.cseq(), Some((1, Method::Ack)));
    assert_eq!(ack.to_tag().as_deref(), Some("srv-1"));

    eventually("accepted callback", Duration::from_secs(3), || !events.accepted.lock().is_empty()).await;
    assert_eq!(manager.call_state("CID-A"), Some(CallState::Accepted));
    assert_eq!(manager.call_record("CID-A").unwrap().status, CallState::Accepted);
    assert_eq!(manager.wait_answer("CID-A").await.unwrap().status(), 200);

    // the relay binds the WhatsApp side on the port promised in the offer
    eventually("RTP stream", Duration::from_secs(3), || {
        manager.rtp_proxy().stream("CID-A").is_some()
    })
    .await;
    let stream = manager.rtp_proxy().stream("CID-A").unwrap();
    assert_eq!(stream.whatsapp_port(), offered);
    assert_ne!(stream.sip_port(), offered);

    // a retransmitted 2xx is ACKed again but not reported again
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.respond(&invite, 200, Some(&sdp), source).await;
    server.expect_request(Method::Ack).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(events.accepted.lock().clone(), vec![("CID-A".to_string(), 200)]);
    assert!(events.rejected.lock().is_empty());

    // hang up from our side
    manager.cancel_call("CID-A").await.unwrap();
    let (bye, _) = server.expect_request(Method::Bye).await;
    assert_eq!(bye.cseq(), Some((2, Method::Bye)));
    assert_eq!(bye.to_tag().as_deref(), Some("srv-1"));
    assert_eq!(manager.call_state("CID-A"), Some(CallState::Terminated));
    assert!(manager.rtp_proxy().stream("CID-A").is_none());
    assert_eq!(
        events.terminated.lock().clone(),
        vec![("CID-A".to_string(), TerminationReason::LocalBye)]
    );

    // second cancel: nothing on the wire
    manager.cancel_call("CID-A").await.unwrap();
    server.expect_silence(Duration::from_millis(200)).await;

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn rejected_call_is_reported_once() {
    let server = FakeSipServer::bind().await;
    let manager = Manager::new(settings(server.addr(), "35200-35300")).unwrap();
    let events = subscribe(&manager);

    manager.send_invite("CID-A", FROM, TO).await.unwrap();
    let (invite, source) = server.expect_request(Method::Invite).await;

    server.respond(&invite, 603, None, source).await;
    eventually("rejected callback", Duration::from_secs(3), || !events.rejected.lock().is_empty()).await;

    // a retransmission of the final response changes nothing
    server.respond(&invite, 603, None, source).await;
    server.expect_silence(Duration::from_millis(300)).await;

    assert_eq!(events.rejected.lock().clone(), vec![("CID-A".to_string(), 603)]);
    assert!(events.accepted.lock().is_empty());
    assert_eq!(manager.call_state("CID-A"), Some(CallState::Rejected));
    assert!(manager.active_call_ids().is_empty());
    assert!(manager.call_record("CID-A").is_none());
    assert!(manager.rtp_proxy().reserved_port("CID-A").is_none());

    let failed = manager.call_tests().failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].sip_response, Some(603));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn wait_answer_reports_rejection() {
    let server = FakeSipServer::bind().await;
    let manager = Arc::new(Manager::new(settings(server.addr(), "35400-35500")).unwrap());

    manager.send_invite("CID-W", FROM, TO).await.unwrap();
    let (invite, source) = server.expect_request(Method::Invite).await;

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.wait_answer("CID-W").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.respond(&invite, 486, None, source).await;

    match waiter.await.unwrap() {
        Err(SipProxyError::DialogRejected { code, reason }) => {
            assert_eq!(code, 486);
            assert_eq!(reason, "Busy Here");
        }
        other => panic!("unexpected {:?}", other),
    }
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn unanswered_invite_times_out() {
    let server = FakeSipServer::bind().await;
    let manager = Manager::new(settings(server.addr(), "35600-35700").with_invite_timeout(Duration::from_secs(2))).unwrap();
    let events = subscribe(&manager);

    let started = Instant::now();
    manager.send_invite("CID-T", FROM, TO).await.unwrap();
    let (invite, source) = server.expect_request(Method::Invite).await;

    // provisional responses do not stop the clock
    server.respond(&invite, 180, None, source).await;

    eventually("timeout", Duration::from_secs(5), || !events.rejected.lock().is_empty()).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "timed out after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(4), "timed out after {:?}", elapsed);

    assert_eq!(events.rejected.lock().clone(), vec![("CID-T".to_string(), 408)]);
    assert_eq!(manager.call_state("CID-T"), Some(CallState::Timeout));

    // a late 2xx is acknowledged and hung up, never reported
    server.respond(&invite, 200, Some(&answer_sdp(5004)), source).await;
    let (ack, _) = server.expect_request(Method::Ack).await;
    assert_eq!(ack.cseq(), Some((1, Method::Ack)));
    let (bye, _) = server.expect_request(Method::Bye).await;
    assert_eq!(bye.call_id().as_deref(), Some("CID-T"));
    assert_eq!(bye.to_tag().as_deref(), Some("srv-1"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.accepted.lock().is_empty());
    assert_eq!(events.rejected.lock().len(), 1);
    assert_eq!(manager.call_state("CID-T"), Some(CallState::Timeout));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn duplicate_call_ids() {
    let server = FakeSipServer::bind().await;
    let manager = Manager::new(settings(server.addr(), "35800-35900")).unwrap();

    manager.send_invite("CID-A", FROM, TO).await.unwrap();
    server.expect_request(Method::Invite).await;

    manager.send_invite("CID-A", FROM, TO).await.unwrap();
    server.expect_silence(Duration::from_millis(300)).await;

    let err = manager.send_invite("CID-A", FROM, "5511777770000").await.unwrap_err();
    assert!(matches!(err, SipProxyError::DuplicateCallId { .. }));
    // repeats while the call is active do not use up attempts
    assert_eq!(manager.call_attempts("CID-A"), 1);
    assert_eq!(manager.active_call_ids(), vec!["CID-A".to_string()]);

    let record = manager.call_record("CID-A").unwrap();
    assert_eq!(record.to, TO);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn finished_call_id_gets_no_second_invite() {
    let server = FakeSipServer::bind().await;
    let manager = Manager::new(settings(server.addr(), "36400-36500")).unwrap();
    let events = subscribe(&manager);

    manager.send_invite("CID-R", FROM, TO).await.unwrap();
    let (invite, source) = server.expect_request(Method::Invite).await;
    server.respond(&invite, 603, None, source).await;
    eventually("rejected callback", Duration::from_secs(3), || !events.rejected.lock().is_empty()).await;
    eventually("record cleared", Duration::from_secs(3), || manager.call_record("CID-R").is_none()).await;

    match manager.send_invite("CID-R", FROM, TO).await {
        Err(SipProxyError::AttemptsExhausted { call_id, attempts }) => {
            assert_eq!(call_id, "CID-R");
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected {:?}", other),
    }
    server.expect_silence(Duration::from_millis(300)).await;
    assert_eq!(manager.call_attempts("CID-R"), 1);
    assert!(manager.call_record("CID-R").is_none());
    assert_eq!(events.rejected.lock().len(), 1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn remote_bye_ends_accepted_call() {
    let server = FakeSipServer::bind().await;
    let manager = Manager::new(settings(server.addr(), "36000-36100")).unwrap();
    let events = subscribe(&manager);

    manager.send_invite("CID-B", FROM, TO).await.unwrap();
    let (invite, source) = server.expect_request(Method::Invite).await;
    server.respond(&invite, 200, None, source).await;
    server.expect_request(Method::Ack).await;
    eventually("accepted", Duration::from_secs(3), || !events.accepted.lock().is_empty()).await;

    let bye = format!(
        "BYE sip:{from}@127.0.0.1:{port} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {server};branch=z9hG4bKsrvbye\r\n\
         From: <sip:{to}@127.0.0.1>;tag=srv-1\r\n\
         To: {our_from}\r\n\
         Call-ID: CID-B\r\n\
         CSeq: 1 BYE\r\n\
         Content-Length: 0\r\n\r\n",
        from = FROM,
        to = TO,
        port = source.port(),
        server = server.addr(),
        our_from = invite.from_header().unwrap().value(),
    );
    server.send(&parse(bye.as_bytes()).unwrap(), source).await;

    let ok = server.expect_response().await;
    assert_eq!(ok.status(), 200);
    assert_eq!(ok.cseq(), Some((1, Method::Bye)));

    eventually("terminated", Duration::from_secs(3), || !events.terminated.lock().is_empty()).await;
    assert_eq!(
        events.terminated.lock().clone(),
        vec![("CID-B".to_string(), TerminationReason::RemoteBye)]
    );
    assert_eq!(manager.call_state("CID-B"), Some(CallState::Terminated));
    assert!(manager.active_call_ids().is_empty());

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn stop_cancels_pending_calls() {
    let server = FakeSipServer::bind().await;
    let manager = Manager::new(settings(server.addr(), "36200-36300")).unwrap();

    manager.send_invite("CID-S", FROM, TO).await.unwrap();
    let (invite, _) = server.expect_request(Method::Invite).await;
    assert!(manager.is_running().await);

    manager.stop().await.unwrap();
    let (cancel, _) = server.expect_request(Method::Cancel).await;
    assert_eq!(cancel.via_branch(), invite.via_branch());

    assert!(!manager.is_running().await);
    assert_eq!(manager.call_state("CID-S"), Some(CallState::Cancelled));
    assert!(manager.active_call_ids().is_empty());
    assert_eq!(manager.stats().await.active_calls, 0);

    // stopping twice is fine
    manager.stop().await.unwrap();
}
