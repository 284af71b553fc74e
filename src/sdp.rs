//! Session descriptions carried in INVITE and 200 OK.
//!
//! Media is never started; the offer/answer is exchanged so peers accept
//! the call and the remote endpoint can be reported.

use std::net::IpAddr;

use crate::error::{Result, UaError};

pub const CONTENT_TYPE: &str = "application/sdp";

/// Audio port advertised in offers and answers
pub const DEFAULT_AUDIO_PORT: u16 = 10000;

/// Remote audio endpoint announced by the peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaEndpoint {
    pub address: String,
    pub port: u16,
    pub payload_type: u8,
}

/// PCMU/PCMA/telephone-event audio description
pub fn audio_description(local_ip: IpAddr, port: u16, session_id: u64) -> String {
    format!(
        "v=0\r\n\
         o=- {} {} IN IP4 {}\r\n\
         s=voip-demo call\r\n\
         c=IN IP4 {}\r\n\
         t=0 0\r\n\
         m=audio {} RTP/AVP 0 8 101\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=rtpmap:8 PCMA/8000\r\n\
         a=rtpmap:101 telephone-event/8000\r\n\
         a=sendrecv\r\n",
        session_id, session_id, local_ip, local_ip, port
    )
}

pub fn session_id() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// First audio stream of a peer description.
///
/// A `c=` line inside the audio section overrides the session-level one.
/// The first listed payload type is the preferred codec; a malformed one
/// rejects the description rather than guessing.
pub fn parse_media_endpoint(sdp: &str) -> Result<MediaEndpoint> {
    let mut session_address: Option<&str> = None;
    let mut media_address: Option<&str> = None;
    let mut audio: Option<(u16, u8)> = None;
    let mut in_audio = false;
    let mut seen_media = false;

    for line in sdp.lines().map(str::trim) {
        if let Some(media) = line.strip_prefix("m=") {
            in_audio = false;
            seen_media = true;
            if audio.is_some() {
                continue;
            }
            let mut fields = media.split_whitespace();
            if fields.next() != Some("audio") {
                continue;
            }
            let port = fields
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| UaError::parse(format!("bad audio port in {:?}", line)))?;
            let payload_type = fields
                .nth(1)
                .and_then(|pt| pt.parse().ok())
                .ok_or_else(|| UaError::parse(format!("bad payload type in {:?}", line)))?;
            audio = Some((port, payload_type));
            in_audio = true;
        } else if let Some(connection) = line.strip_prefix("c=") {
            // IN IP4 <address>
            let address = connection.split_whitespace().nth(2);
            if in_audio {
                media_address = address.or(media_address);
            } else if !seen_media {
                session_address = address.or(session_address);
            }
        }
    }

    let (port, payload_type) = audio.ok_or_else(|| UaError::parse("no audio stream in SDP"))?;
    let address = media_address
        .or(session_address)
        .ok_or_else(|| UaError::parse("no connection address for audio stream"))?;
    Ok(MediaEndpoint {
        address: address.to_string(),
        port,
        payload_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdp_parsing() {
        let sdp = "v=0\r\n\
                   o=root 123 456 IN IP4 192.168.1.1\r\n\
                   s=Test\r\n\
                   c=IN IP4 192.168.1.100\r\n\
                   t=0 0\r\n\
                   m=audio 12345 RTP/AVP 8 0 101\r\n";

        let endpoint = parse_media_endpoint(sdp).unwrap();
        assert_eq!(endpoint.address, "192.168.1.100");
        assert_eq!(endpoint.port, 12345);
        assert_eq!(endpoint.payload_type, 8);
    }

    #[test]
    fn test_own_description_parses() {
        let sdp = audio_description("10.1.2.3".parse().unwrap(), 4000, 42);
        let endpoint = parse_media_endpoint(&sdp).unwrap();
        assert_eq!(endpoint.address, "10.1.2.3");
        assert_eq!(endpoint.port, 4000);
        assert_eq!(endpoint.payload_type, 0);
    }

    #[test]
    fn test_media_level_connection_wins() {
        let sdp = "v=0\r\n\
                   c=IN IP4 10.0.0.1\r\n\
                   m=video 5000 RTP/AVP 96\r\n\
                   c=IN IP4 10.0.0.2\r\n\
                   m=audio 6000 RTP/AVP 18 0\r\n\
                   c=IN IP4 10.0.0.3\r\n";

        let endpoint = parse_media_endpoint(sdp).unwrap();
        assert_eq!(endpoint.address, "10.0.0.3");
        assert_eq!(endpoint.port, 6000);
        assert_eq!(endpoint.payload_type, 18);
    }

    #[test]
    fn test_malformed_payload_type_is_rejected() {
        let sdp = "v=0\r\nc=IN IP4 1.2.3.4\r\nm=audio 4000 RTP/AVP pcmu\r\n";
        assert!(matches!(parse_media_endpoint(sdp), Err(UaError::Parse { .. })));
    }

    #[test]
    fn test_missing_media_line() {
        assert!(parse_media_endpoint("v=0\r\nc=IN IP4 1.2.3.4\r\n").is_err());
    }
}
