//! Minimal SDP handling for the signaling exchange: parse what routing
//! needs out of the offer, print an ICE-lite answer.

use shared::error::{Error, Result};

pub const TWCC_EXT_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

/// The subset of a browser offer the server acts on.
#[derive(Debug, Default, Clone)]
pub struct SdpOffer {
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub fingerprint: String,
    /// Peer wants to send (publish) when true.
    pub sending: bool,
    pub audio_payload_type: Option<u8>,
    pub video_payload_type: Option<u8>,
    pub audio_ssrc: Option<u32>,
    pub video_ssrc: Option<u32>,
    /// Offered setup attribute: `actpass`, `active` or `passive`.
    pub setup: String,
    /// Negotiated TWCC header extension id, if offered.
    pub twcc_ext_id: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    None,
    Audio,
    Video,
}

impl SdpOffer {
    pub fn parse(sdp: &str) -> Result<Self> {
        let mut offer = SdpOffer::default();
        let mut media = MediaKind::None;
        let mut rtpmaps: Vec<(MediaKind, u8, String)> = Vec::new();

        for line in sdp.lines() {
            let line = line.trim_end();
            if let Some(m) = line.strip_prefix("m=") {
                media = if m.starts_with("audio") {
                    MediaKind::Audio
                } else if m.starts_with("video") {
                    MediaKind::Video
                } else {
                    MediaKind::None
                };
            } else if let Some(v) = line.strip_prefix("a=ice-ufrag:") {
                offer.ice_ufrag = v.to_string();
            } else if let Some(v) = line.strip_prefix("a=ice-pwd:") {
                offer.ice_pwd = v.to_string();
            } else if let Some(v) = line.strip_prefix("a=fingerprint:") {
                offer.fingerprint = v.to_string();
            } else if let Some(v) = line.strip_prefix("a=setup:") {
                offer.setup = v.to_string();
            } else if line == "a=sendonly" || line == "a=sendrecv" {
                offer.sending = true;
            } else if let Some(v) = line.strip_prefix("a=rtpmap:") {
                if let Some((pt, codec)) = v.split_once(' ') {
                    if let Ok(pt) = pt.parse::<u8>() {
                        rtpmaps.push((media, pt, codec.to_ascii_lowercase()));
                    }
                }
            } else if let Some(v) = line.strip_prefix("a=ssrc:") {
                if let Some(ssrc) = v.split_whitespace().next().and_then(|s| s.parse().ok()) {
                    match media {
                        MediaKind::Audio if offer.audio_ssrc.is_none() => {
                            offer.audio_ssrc = Some(ssrc)
                        }
                        MediaKind::Video if offer.video_ssrc.is_none() => {
                            offer.video_ssrc = Some(ssrc)
                        }
                        _ => {}
                    }
                }
            } else if let Some(v) = line.strip_prefix("a=extmap:") {
                if let Some((id, uri)) = v.split_once(' ') {
                    if uri == TWCC_EXT_URI {
                        offer.twcc_ext_id = id.parse().ok();
                    }
                }
            }
        }

        for (kind, pt, codec) in rtpmaps {
            match kind {
                MediaKind::Audio if codec.starts_with("opus") => {
                    offer.audio_payload_type.get_or_insert(pt);
                }
                MediaKind::Video if codec.starts_with("h264") => {
                    offer.video_payload_type.get_or_insert(pt);
                }
                _ => {}
            }
        }

        if offer.ice_ufrag.is_empty() || offer.ice_pwd.is_empty() {
            return Err(Error::SdpDecode("offer missing ice credentials".into()));
        }
        if offer.fingerprint.is_empty() {
            return Err(Error::SdpDecode("offer missing fingerprint".into()));
        }
        Ok(offer)
    }
}

/// Everything the answer template needs.
pub struct AnswerParams<'a> {
    pub ice_ufrag: &'a str,
    pub ice_pwd: &'a str,
    pub fingerprint: &'a str,
    /// `passive` answers DTLS, `active` initiates.
    pub dtls_setup: &'a str,
    pub candidate_ip: &'a str,
    pub candidate_port: u16,
    /// Server sends media (play) or receives it (publish).
    pub sending: bool,
    pub audio_payload_type: u8,
    pub video_payload_type: u8,
    pub audio_ssrc: u32,
    pub video_ssrc: u32,
}

/// Prints the ICE-lite answer.
pub fn build_answer(p: &AnswerParams<'_>) -> String {
    let direction = if p.sending { "sendonly" } else { "recvonly" };
    let mut out = String::new();
    out.push_str("v=0\r\n");
    out.push_str("o=rill 0 2 IN IP4 0.0.0.0\r\n");
    out.push_str("s=rill\r\n");
    out.push_str("t=0 0\r\n");
    out.push_str("a=ice-lite\r\n");
    out.push_str("a=group:BUNDLE 0 1\r\n");
    out.push_str("a=msid-semantic: WMS rill\r\n");

    for (mid, kind) in [("0", "audio"), ("1", "video")] {
        let pt = if kind == "audio" {
            p.audio_payload_type
        } else {
            p.video_payload_type
        };
        out.push_str(&format!("m={kind} 9 UDP/TLS/RTP/SAVPF {pt}\r\n"));
        out.push_str("c=IN IP4 0.0.0.0\r\n");
        out.push_str("a=rtcp:9 IN IP4 0.0.0.0\r\n");
        out.push_str(&format!("a=ice-ufrag:{}\r\n", p.ice_ufrag));
        out.push_str(&format!("a=ice-pwd:{}\r\n", p.ice_pwd));
        out.push_str(&format!("a=fingerprint:sha-256 {}\r\n", p.fingerprint));
        out.push_str(&format!("a=setup:{}\r\n", p.dtls_setup));
        out.push_str(&format!("a=mid:{mid}\r\n"));
        out.push_str(&format!("a={direction}\r\n"));
        out.push_str("a=rtcp-mux\r\n");
        if kind == "audio" {
            out.push_str(&format!("a=rtpmap:{pt} opus/48000/2\r\n"));
        } else {
            out.push_str(&format!("a=rtpmap:{pt} H264/90000\r\n"));
            out.push_str(&format!("a=rtcp-fb:{pt} nack\r\n"));
            out.push_str(&format!("a=rtcp-fb:{pt} nack pli\r\n"));
        }
        if p.sending {
            let ssrc = if kind == "audio" {
                p.audio_ssrc
            } else {
                p.video_ssrc
            };
            out.push_str(&format!("a=ssrc:{ssrc} cname:rill\r\n"));
        }
        out.push_str(&format!(
            "a=candidate:0 1 udp 2130706431 {} {} typ host generation 0\r\n",
            p.candidate_ip, p.candidate_port
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=- 1 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=ice-ufrag:cli1\r\n\
        a=ice-pwd:clipassword0123456789012345\r\n\
        a=fingerprint:sha-256 AA:BB\r\n\
        a=setup:actpass\r\n\
        a=sendonly\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=ssrc:1111 cname:x\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 102 106\r\n\
        a=rtpmap:102 H264/90000\r\n\
        a=rtpmap:106 rtx/90000\r\n\
        a=extmap:3 http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01\r\n\
        a=ssrc:2222 cname:x\r\n";

    #[test]
    fn test_parse_offer() {
        let o = SdpOffer::parse(OFFER).unwrap();
        assert_eq!(o.ice_ufrag, "cli1");
        assert_eq!(o.ice_pwd, "clipassword0123456789012345");
        assert!(o.sending);
        assert_eq!(o.audio_payload_type, Some(111));
        assert_eq!(o.video_payload_type, Some(102));
        assert_eq!(o.audio_ssrc, Some(1111));
        assert_eq!(o.video_ssrc, Some(2222));
        assert_eq!(o.setup, "actpass");
        assert_eq!(o.twcc_ext_id, Some(3));
    }

    #[test]
    fn test_missing_credentials_fail() {
        assert!(SdpOffer::parse("v=0\r\nm=audio 9 X 0\r\n").is_err());
    }

    #[test]
    fn test_answer_shape() {
        let answer = build_answer(&AnswerParams {
            ice_ufrag: "srv",
            ice_pwd: "srvpassword0123456789012345",
            fingerprint: "AA:BB",
            dtls_setup: "passive",
            candidate_ip: "192.0.2.1",
            candidate_port: 8000,
            sending: true,
            audio_payload_type: 111,
            video_payload_type: 102,
            audio_ssrc: 7001,
            video_ssrc: 7002,
        });
        assert!(answer.contains("a=ice-lite"));
        assert!(answer.contains("a=ice-ufrag:srv"));
        assert!(answer.contains("a=setup:passive"));
        assert!(answer.contains("a=sendonly"));
        assert!(answer.contains("a=ssrc:7002 cname:rill"));
        assert!(answer.contains("a=rtcp-fb:102 nack pli"));
        assert!(answer.contains("192.0.2.1 8000"));
        // parses back as an offer-shaped blob
        let parsed = SdpOffer::parse(&answer).unwrap();
        assert_eq!(parsed.video_payload_type, Some(102));
    }
}
