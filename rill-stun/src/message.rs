//! STUN binding message codec (RFC 5389 subset for an ICE-lite server).
//!
//! Covers exactly what answering connectivity checks needs: parse a binding
//! request, verify MESSAGE-INTEGRITY (HMAC-SHA1 over the short-term
//! credential) and FINGERPRINT (CRC-32), and emit a binding response with
//! XOR-MAPPED-ADDRESS, integrity and fingerprint.

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use shared::buffer::BytesReader;
use shared::error::{Error, Result};
use std::net::{IpAddr, SocketAddr};

type HmacSha1 = Hmac<Sha1>;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
const HEADER_LEN: usize = 20;
const FINGERPRINT_XOR: u32 = 0x5354_554E;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_PRIORITY: u16 = 0x0024;
const ATTR_USE_CANDIDATE: u16 = 0x0025;
const ATTR_FINGERPRINT: u16 = 0x8028;
const ATTR_ICE_CONTROLLED: u16 = 0x8029;
const ATTR_ICE_CONTROLLING: u16 = 0x802A;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// First-byte classification: STUN messages start 0x00 or 0x01.
pub fn is_stun(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN
        && data[0] < 2
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    BindingRequest,
    BindingResponse,
    BindingError,
    Other(u16),
}

impl MessageType {
    fn from_raw(v: u16) -> Self {
        match v {
            0x0001 => MessageType::BindingRequest,
            0x0101 => MessageType::BindingResponse,
            0x0111 => MessageType::BindingError,
            other => MessageType::Other(other),
        }
    }
}

/// A parsed STUN message with the attributes the ICE-lite server consumes.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: MessageType,
    pub transaction_id: [u8; 12],
    pub username: Option<String>,
    pub priority: Option<u32>,
    pub use_candidate: bool,
    pub ice_controlling: bool,
    pub mapped_address: Option<SocketAddr>,
    has_integrity: bool,
    has_fingerprint: bool,
}

impl Message {
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut r = BytesReader::new(data);
        let raw_type = r
            .read_u16()
            .map_err(|_| Error::StunDecode("short header".into()))?;
        let length = r.read_u16()? as usize;
        let cookie = r.read_u32()?;
        if cookie != MAGIC_COOKIE {
            return Err(Error::StunDecode("bad magic cookie".into()));
        }
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(r.read_slice(12)?);
        if r.remaining() < length {
            return Err(Error::StunDecode("truncated attributes".into()));
        }

        let mut msg = Message {
            message_type: MessageType::from_raw(raw_type),
            transaction_id,
            username: None,
            priority: None,
            use_candidate: false,
            ice_controlling: false,
            mapped_address: None,
            has_integrity: false,
            has_fingerprint: false,
        };

        let mut attrs = BytesReader::new(r.read_slice(length)?);
        while attrs.remaining() >= 4 {
            let typ = attrs.read_u16()?;
            let len = attrs.read_u16()? as usize;
            let value = attrs.read_slice(len)?;
            // attributes are padded to 32-bit boundaries
            let pad = (4 - len % 4) % 4;
            if pad > 0 && attrs.remaining() >= pad {
                attrs.skip(pad)?;
            }
            match typ {
                ATTR_USERNAME => {
                    msg.username = Some(String::from_utf8_lossy(value).into_owned());
                }
                ATTR_PRIORITY if len == 4 => {
                    msg.priority =
                        Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
                }
                ATTR_USE_CANDIDATE => msg.use_candidate = true,
                ATTR_ICE_CONTROLLING => msg.ice_controlling = true,
                ATTR_ICE_CONTROLLED => {}
                ATTR_MESSAGE_INTEGRITY => msg.has_integrity = true,
                ATTR_FINGERPRINT => msg.has_fingerprint = true,
                ATTR_XOR_MAPPED_ADDRESS => {
                    msg.mapped_address = parse_xor_mapped(value, &transaction_id)?;
                }
                _ => {}
            }
        }
        Ok(msg)
    }

    /// Local half of `local:remote` in the USERNAME attribute, which is the
    /// ice-ufrag that routes the request to a session.
    pub fn local_ufrag(&self) -> Option<&str> {
        self.username.as_deref().and_then(|u| u.split(':').next())
    }

    /// Validates FINGERPRINT then MESSAGE-INTEGRITY over the raw datagram.
    ///
    /// An invalid message must be dropped without a response, so both
    /// failures are errors rather than flags.
    pub fn check_integrity(raw: &[u8], password: &str) -> Result<()> {
        let (integrity_off, fingerprint_off) = locate_trailers(raw)?;

        if let Some(fp_off) = fingerprint_off {
            let expect = u32::from_be_bytes([
                raw[fp_off + 4],
                raw[fp_off + 5],
                raw[fp_off + 6],
                raw[fp_off + 7],
            ]);
            let crc = CRC32.checksum(&raw[..fp_off]) ^ FINGERPRINT_XOR;
            if crc != expect {
                return Err(Error::StunFingerprintMismatch);
            }
        }

        let Some(mi_off) = integrity_off else {
            return Err(Error::StunIntegrityMismatch);
        };
        // length is rewritten as if the message ended right after integrity
        let adjusted_len = (mi_off + 24 - HEADER_LEN) as u16;
        let mut input = raw[..mi_off].to_vec();
        input[2] = (adjusted_len >> 8) as u8;
        input[3] = (adjusted_len & 0xFF) as u8;

        let mut mac = HmacSha1::new_from_slice(password.as_bytes())
            .map_err(|_| Error::StunIntegrityMismatch)?;
        mac.update(&input);
        let tag = mac.finalize().into_bytes();
        if tag.as_slice() != &raw[mi_off + 4..mi_off + 24] {
            return Err(Error::StunIntegrityMismatch);
        }
        Ok(())
    }

    /// Builds a binding success response mirroring `transaction_id`, with
    /// the peer's reflexive address, integrity and fingerprint.
    pub fn binding_response(
        transaction_id: &[u8; 12],
        peer: SocketAddr,
        password: &str,
    ) -> Result<Bytes> {
        let mut attrs = BytesMut::new();
        write_xor_mapped(&mut attrs, peer, transaction_id);

        let mut msg = BytesMut::with_capacity(HEADER_LEN + attrs.len() + 32);
        msg.put_u16(0x0101);
        msg.put_u16((attrs.len() + 24) as u16); // as if integrity were last
        msg.put_u32(MAGIC_COOKIE);
        msg.extend_from_slice(transaction_id);
        msg.extend_from_slice(&attrs);

        let mut mac = HmacSha1::new_from_slice(password.as_bytes())
            .map_err(|e| Error::StunDecode(e.to_string()))?;
        mac.update(&msg);
        let tag = mac.finalize().into_bytes();
        msg.put_u16(ATTR_MESSAGE_INTEGRITY);
        msg.put_u16(20);
        msg.extend_from_slice(&tag);

        // final length includes the fingerprint attribute
        let final_len = (msg.len() - HEADER_LEN + 8) as u16;
        msg[2] = (final_len >> 8) as u8;
        msg[3] = (final_len & 0xFF) as u8;
        let crc = CRC32.checksum(&msg) ^ FINGERPRINT_XOR;
        msg.put_u16(ATTR_FINGERPRINT);
        msg.put_u16(4);
        msg.put_u32(crc);

        Ok(msg.freeze())
    }

    /// Builds a binding request for the client role of connectivity checks.
    pub fn binding_request(username: &str, password: &str) -> Result<(Bytes, [u8; 12])> {
        let transaction_id: [u8; 12] = rand::random();

        let mut attrs = BytesMut::new();
        attrs.put_u16(ATTR_USERNAME);
        attrs.put_u16(username.len() as u16);
        attrs.extend_from_slice(username.as_bytes());
        while attrs.len() % 4 != 0 {
            attrs.put_u8(0);
        }

        let mut msg = BytesMut::new();
        msg.put_u16(0x0001);
        msg.put_u16((attrs.len() + 24) as u16);
        msg.put_u32(MAGIC_COOKIE);
        msg.extend_from_slice(&transaction_id);
        msg.extend_from_slice(&attrs);

        let mut mac = HmacSha1::new_from_slice(password.as_bytes())
            .map_err(|e| Error::StunDecode(e.to_string()))?;
        mac.update(&msg);
        let tag = mac.finalize().into_bytes();
        msg.put_u16(ATTR_MESSAGE_INTEGRITY);
        msg.put_u16(20);
        msg.extend_from_slice(&tag);

        let final_len = (msg.len() - HEADER_LEN + 8) as u16;
        msg[2] = (final_len >> 8) as u8;
        msg[3] = (final_len & 0xFF) as u8;
        let crc = CRC32.checksum(&msg) ^ FINGERPRINT_XOR;
        msg.put_u16(ATTR_FINGERPRINT);
        msg.put_u16(4);
        msg.put_u32(crc);

        Ok((msg.freeze(), transaction_id))
    }
}

/// Finds the byte offsets of MESSAGE-INTEGRITY and FINGERPRINT attributes.
fn locate_trailers(raw: &[u8]) -> Result<(Option<usize>, Option<usize>)> {
    if raw.len() < HEADER_LEN {
        return Err(Error::StunDecode("short message".into()));
    }
    let mut integrity = None;
    let mut fingerprint = None;
    let mut off = HEADER_LEN;
    while off + 4 <= raw.len() {
        let typ = u16::from_be_bytes([raw[off], raw[off + 1]]);
        let len = u16::from_be_bytes([raw[off + 2], raw[off + 3]]) as usize;
        match typ {
            ATTR_MESSAGE_INTEGRITY => integrity = Some(off),
            ATTR_FINGERPRINT => fingerprint = Some(off),
            _ => {}
        }
        off += 4 + len + (4 - len % 4) % 4;
    }
    Ok((integrity, fingerprint))
}

fn parse_xor_mapped(value: &[u8], transaction_id: &[u8; 12]) -> Result<Option<SocketAddr>> {
    if value.len() < 8 {
        return Err(Error::StunDecode("short xor-mapped-address".into()));
    }
    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    match family {
        0x01 => {
            let ip = u32::from_be_bytes([value[4], value[5], value[6], value[7]]) ^ MAGIC_COOKIE;
            Ok(Some(SocketAddr::new(
                IpAddr::V4(ip.to_be_bytes().into()),
                port,
            )))
        }
        0x02 => {
            if value.len() < 20 {
                return Err(Error::StunDecode("short xor-mapped v6".into()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            let cookie = MAGIC_COOKIE.to_be_bytes();
            for i in 0..4 {
                octets[i] ^= cookie[i];
            }
            for i in 0..12 {
                octets[4 + i] ^= transaction_id[i];
            }
            Ok(Some(SocketAddr::new(IpAddr::V6(octets.into()), port)))
        }
        _ => Ok(None),
    }
}

fn write_xor_mapped(out: &mut BytesMut, addr: SocketAddr, transaction_id: &[u8; 12]) {
    let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match addr.ip() {
        IpAddr::V4(v4) => {
            out.put_u16(ATTR_XOR_MAPPED_ADDRESS);
            out.put_u16(8);
            out.put_u8(0);
            out.put_u8(0x01);
            out.put_u16(xport);
            out.put_u32(u32::from(v4) ^ MAGIC_COOKIE);
        }
        IpAddr::V6(v6) => {
            out.put_u16(ATTR_XOR_MAPPED_ADDRESS);
            out.put_u16(20);
            out.put_u8(0);
            out.put_u8(0x02);
            out.put_u16(xport);
            let mut octets = v6.octets();
            let cookie = MAGIC_COOKIE.to_be_bytes();
            for i in 0..4 {
                octets[i] ^= cookie[i];
            }
            for i in 0..12 {
                octets[4 + i] ^= transaction_id[i];
            }
            out.extend_from_slice(&octets);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_binding_request_round_trip() {
        let (wire, tid) = Message::binding_request("remote:local", "secret").unwrap();
        assert!(is_stun(&wire));
        let msg = Message::unmarshal(&wire).unwrap();
        assert_eq!(msg.message_type, MessageType::BindingRequest);
        assert_eq!(msg.transaction_id, tid);
        assert_eq!(msg.username.as_deref(), Some("remote:local"));
        assert_eq!(msg.local_ufrag(), Some("remote"));
        assert!(msg.has_integrity);
        assert!(msg.has_fingerprint);
        Message::check_integrity(&wire, "secret").unwrap();
    }

    #[test]
    fn test_wrong_password_rejected() {
        let (wire, _) = Message::binding_request("a:b", "right").unwrap();
        assert!(matches!(
            Message::check_integrity(&wire, "wrong"),
            Err(Error::StunIntegrityMismatch)
        ));
    }

    #[test]
    fn test_corrupt_fingerprint_rejected() {
        let (wire, _) = Message::binding_request("a:b", "pw").unwrap();
        let mut bad = wire.to_vec();
        let n = bad.len();
        bad[n - 1] ^= 0xFF;
        assert!(matches!(
            Message::check_integrity(&bad, "pw"),
            Err(Error::StunFingerprintMismatch)
        ));
    }

    #[test]
    fn test_binding_response_mapped_address() {
        let tid = [7u8; 12];
        let peer = SocketAddr::from_str("203.0.113.9:40000").unwrap();
        let wire = Message::binding_response(&tid, peer, "pw").unwrap();
        Message::check_integrity(&wire, "pw").unwrap();

        let msg = Message::unmarshal(&wire).unwrap();
        assert_eq!(msg.message_type, MessageType::BindingResponse);
        assert_eq!(msg.mapped_address, Some(peer));
    }

    #[test]
    fn test_xor_mapped_v6() {
        let tid = [3u8; 12];
        let peer = SocketAddr::from_str("[2001:db8::1]:9000").unwrap();
        let wire = Message::binding_response(&tid, peer, "pw").unwrap();
        let msg = Message::unmarshal(&wire).unwrap();
        assert_eq!(msg.mapped_address, Some(peer));
    }

    #[test]
    fn test_is_stun_rejects_rtp() {
        // RTP first byte is 0x80
        assert!(!is_stun(&[0x80u8; 24]));
        // too short
        assert!(!is_stun(&[0x00, 0x01]));
    }

    #[test]
    fn test_use_candidate_flag() {
        // append USE-CANDIDATE to a request by hand
        let (wire, _) = Message::binding_request("a:b", "pw").unwrap();
        let mut v = wire.to_vec();
        v.extend_from_slice(&[0x00, 0x25, 0x00, 0x00]);
        let new_len = (v.len() - HEADER_LEN) as u16;
        v[2] = (new_len >> 8) as u8;
        v[3] = (new_len & 0xFF) as u8;
        let msg = Message::unmarshal(&v).unwrap();
        assert!(msg.use_candidate);
    }
}
