//! SDP offer generation and answer inspection.

use std::io::Cursor;
use std::net::Ipv4Addr;

use chrono::Utc;
use ::sdp::description::common::{Address, Attribute, ConnectionInformation};
use ::sdp::description::media::{MediaName, RangedPort};
use ::sdp::description::session::{ATTR_KEY_SEND_RECV, Origin, TimeDescription, Timing};
use ::sdp::{MediaDescription, SessionDescription};
use tracing::debug;

/// Payload types offered, in preference order, with their rtpmap
const AUDIO_FORMATS: [(u8, &str); 3] = [(0, "PCMU/8000"), (8, "PCMA/8000"), (101, "telephone-event/8000")];

const PTIME_MS: u32 = 20;

/// Audio offer advertised in every INVITE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpOffer {
    pub username: String,
    pub session_id: u64,
    pub session_name: String,
    /// Address placed in the origin line
    pub origin_ip: Ipv4Addr,
    /// Address placed in the connection line, reachable through NAT
    pub connection_ip: Ipv4Addr,
    pub rtp_port: u16,
}

fn connection(ip: Ipv4Addr) -> ConnectionInformation {
    ConnectionInformation {
        network_type: "IN".to_string(),
        address_type: "IP4".to_string(),
        address: Some(Address {
            address: ip.to_string(),
            ttl: None,
            range: None,
        }),
    }
}

fn attribute(key: &str, value: Option<String>) -> Attribute {
    Attribute {
        key: key.to_string(),
        value,
    }
}

impl SdpOffer {
    pub fn new(username: impl Into<String>, origin_ip: Ipv4Addr, connection_ip: Ipv4Addr, rtp_port: u16) -> Self {
        Self {
            username: username.into(),
            session_id: Utc::now().timestamp().max(0) as u64,
            session_name: crate::config::DEFAULT_SDP_SESSION_NAME.to_string(),
            origin_ip,
            connection_ip,
            rtp_port,
        }
    }

    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = name.into();
        self
    }

    pub fn session_description(&self) -> SessionDescription {
        let mut session = SessionDescription::default();
        session.version = 0;
        session.origin = Origin {
            username: self.username.clone(),
            session_id: self.session_id,
            session_version: self.session_id + 1,
            network_type: "IN".to_string(),
            address_type: "IP4".to_string(),
            unicast_address: self.origin_ip.to_string(),
        };
        session.session_name = self.session_name.clone();
        session.connection_information = Some(connection(self.connection_ip));
        session.time_descriptions.push(TimeDescription {
            timing: Timing {
                start_time: 0,
                stop_time: 0,
            },
            repeat_times: vec![],
        });

        let mut audio = MediaDescription::default();
        audio.media_name = MediaName {
            media: "audio".to_string(),
            port: RangedPort {
                value: self.rtp_port as isize,
                range: None,
            },
            protos: vec!["RTP".to_string(), "AVP".to_string()],
            formats: AUDIO_FORMATS.iter().map(|(pt, _)| pt.to_string()).collect(),
        };
        for (payload_type, rtpmap) in AUDIO_FORMATS {
            audio
                .attributes
                .push(attribute("rtpmap", Some(format!("{} {}", payload_type, rtpmap))));
        }
        audio.attributes.push(attribute("fmtp", Some("101 0-15".to_string())));
        audio.attributes.push(attribute("ptime", Some(PTIME_MS.to_string())));
        audio.attributes.push(attribute(ATTR_KEY_SEND_RECV, None));
        session.media_descriptions.push(audio);
        session
    }

    /// PCMU, PCMA and telephone-event at 20 ms packetization
    pub fn render(&self) -> String {
        self.session_description().marshal()
    }
}

/// Where the far end wants to receive audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEndpoint {
    pub host: String,
    pub port: u16,
}

/// Read the audio endpoint from an SDP answer.
///
/// A media-level `c=` line overrides the session-level one. Returns `None`
/// when the body is not SDP, there is no audio line, the port is 0 (stream
/// rejected) or no connection address is present.
pub fn parse_answer(body: &str) -> Option<MediaEndpoint> {
    let session = match SessionDescription::unmarshal(&mut Cursor::new(body.as_bytes())) {
        Ok(session) => session,
        Err(e) => {
            debug!("Unreadable SDP answer: {}", e);
            return None;
        }
    };

    let audio = session
        .media_descriptions
        .iter()
        .find(|media| media.media_name.media == "audio")?;
    let port = u16::try_from(audio.media_name.port.value).ok().filter(|p| *p != 0)?;
    let host = audio
        .connection_information
        .as_ref()
        .or(session.connection_information.as_ref())
        .and_then(|c| c.address.as_ref())
        .map(|a| a.address.clone())?;
    Some(MediaEndpoint { host, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_offer() {
        let mut offer = SdpOffer::new(
            "5511999990000",
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(203, 0, 113, 5),
            12000,
        );
        offer.session_id = 1700000000;

        let expected = "v=0\r\n\
            o=5511999990000 1700000000 1700000001 IN IP4 10.0.0.2\r\n\
            s=QuePasa SDP\r\n\
            c=IN IP4 203.0.113.5\r\n\
            t=0 0\r\n\
            m=audio 12000 RTP/AVP 0 8 101\r\n\
            a=rtpmap:0 PCMU/8000\r\n\
            a=rtpmap:8 PCMA/8000\r\n\
            a=rtpmap:101 telephone-event/8000\r\n\
            a=fmtp:101 0-15\r\n\
            a=ptime:20\r\n\
            a=sendrecv\r\n";
        assert_eq!(offer.render(), expected);
    }

    #[test]
    fn session_name_is_configurable() {
        let offer = SdpOffer::new("a", Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 10000).with_session_name("Bridge");
        assert!(offer.render().contains("\r\ns=Bridge\r\n"));
    }

    #[test]
    fn offer_reads_back_as_its_own_endpoint() {
        let offer = SdpOffer::new("a", Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(203, 0, 113, 5), 12000);
        assert_eq!(
            parse_answer(&offer.render()),
            Some(MediaEndpoint {
                host: "203.0.113.5".to_string(),
                port: 12000
            })
        );
    }

    #[test]
    fn parses_session_level_connection() {
        let answer = "v=0\r\no=- 1 1 IN IP4 198.51.100.7\r\ns=-\r\nc=IN IP4 198.51.100.7\r\nt=0 0\r\nm=audio 5004 RTP/AVP 0\r\n";
        assert_eq!(
            parse_answer(answer),
            Some(MediaEndpoint {
                host: "198.51.100.7".to_string(),
                port: 5004
            })
        );
    }

    #[test]
    fn media_connection_overrides_session() {
        let answer = "v=0\r\n\
            o=- 1 1 IN IP4 198.51.100.1\r\n\
            s=-\r\n\
            c=IN IP4 198.51.100.1\r\n\
            t=0 0\r\n\
            m=video 6000 RTP/AVP 96\r\n\
            c=IN IP4 198.51.100.2\r\n\
            m=audio 5006 RTP/AVP 8\r\n\
            c=IN IP4 198.51.100.3\r\n";
        let endpoint = parse_answer(answer).unwrap();
        assert_eq!(endpoint.host, "198.51.100.3");
        assert_eq!(endpoint.port, 5006);
    }

    #[test]
    fn rejected_or_missing_audio() {
        assert_eq!(parse_answer(""), None);
        assert_eq!(parse_answer("not sdp at all"), None);
        let rejected = "v=0\r\no=- 1 1 IN IP4 198.51.100.7\r\ns=-\r\nc=IN IP4 198.51.100.7\r\nt=0 0\r\nm=audio 0 RTP/AVP 0\r\n";
        assert_eq!(parse_answer(rejected), None);
        let no_address = "v=0\r\no=- 1 1 IN IP4 198.51.100.7\r\ns=-\r\nt=0 0\r\nm=audio 5004 RTP/AVP 0\r\n";
        assert_eq!(parse_answer(no_address), None);
    }
}
