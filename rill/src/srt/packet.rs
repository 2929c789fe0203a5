//! SRT packet codec: the v5 caller-listener handshake, data packets and
//! the control subset the server answers.

use bytes::{BufMut, Bytes, BytesMut};
use shared::buffer::BytesReader;
use shared::error::{Error, Result};

pub const SRT_VERSION_5: u32 = 0x0001_0500;
/// Extension-field magic in induction responses.
pub const SRT_MAGIC: u16 = 0x4A17;

pub const HS_TYPE_INDUCTION: i32 = 1;
pub const HS_TYPE_CONCLUSION: i32 = -1;

pub const EXT_TYPE_HSREQ: u16 = 1;
pub const EXT_TYPE_HSRSP: u16 = 2;
pub const EXT_TYPE_STREAMID: u16 = 5;

pub const CTRL_HANDSHAKE: u16 = 0;
pub const CTRL_KEEPALIVE: u16 = 1;
pub const CTRL_ACK: u16 = 2;
pub const CTRL_NAK: u16 = 3;
pub const CTRL_SHUTDOWN: u16 = 5;
pub const CTRL_ACKACK: u16 = 6;

/// One parsed SRT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SrtPacket {
    Data {
        sequence: u32,
        /// PP | O | KK | R | message number word.
        message_flags: u32,
        timestamp: u32,
        dest_socket_id: u32,
        payload: Bytes,
    },
    Control {
        control_type: u16,
        subtype: u16,
        type_specific: u32,
        timestamp: u32,
        dest_socket_id: u32,
        cif: Bytes,
    },
}

impl SrtPacket {
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut r = BytesReader::new(data);
        let first = r
            .read_u32()
            .map_err(|_| Error::SrtDecode("short packet".into()))?;
        if first & 0x8000_0000 == 0 {
            // data packet
            let message_flags = r.read_u32()?;
            let timestamp = r.read_u32()?;
            let dest_socket_id = r.read_u32()?;
            Ok(SrtPacket::Data {
                sequence: first & 0x7FFF_FFFF,
                message_flags,
                timestamp,
                dest_socket_id,
                payload: r.read_remaining(),
            })
        } else {
            let control_type = ((first >> 16) & 0x7FFF) as u16;
            let subtype = (first & 0xFFFF) as u16;
            let type_specific = r.read_u32()?;
            let timestamp = r.read_u32()?;
            let dest_socket_id = r.read_u32()?;
            Ok(SrtPacket::Control {
                control_type,
                subtype,
                type_specific,
                timestamp,
                dest_socket_id,
                cif: r.read_remaining(),
            })
        }
    }

    pub fn marshal(&self) -> Bytes {
        let mut w = BytesMut::new();
        match self {
            SrtPacket::Data {
                sequence,
                message_flags,
                timestamp,
                dest_socket_id,
                payload,
            } => {
                w.put_u32(sequence & 0x7FFF_FFFF);
                w.put_u32(*message_flags);
                w.put_u32(*timestamp);
                w.put_u32(*dest_socket_id);
                w.extend_from_slice(payload);
            }
            SrtPacket::Control {
                control_type,
                subtype,
                type_specific,
                timestamp,
                dest_socket_id,
                cif,
            } => {
                w.put_u32(0x8000_0000 | ((*control_type as u32) << 16) | *subtype as u32);
                w.put_u32(*type_specific);
                w.put_u32(*timestamp);
                w.put_u32(*dest_socket_id);
                w.extend_from_slice(cif);
            }
        }
        w.freeze()
    }
}

/// Handshake control information field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeCif {
    pub version: u32,
    pub encryption: u16,
    pub extension: u16,
    pub initial_sequence: u32,
    pub mtu: u32,
    pub flow_window: u32,
    pub handshake_type: i32,
    pub socket_id: u32,
    pub syn_cookie: u32,
    pub peer_ip: [u8; 16],
    /// (ext type, payload) pairs after the fixed part.
    pub extensions: Vec<(u16, Bytes)>,
}

impl HandshakeCif {
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut r = BytesReader::new(data);
        let mut cif = HandshakeCif {
            version: r.read_u32()?,
            encryption: r.read_u16()?,
            extension: r.read_u16()?,
            initial_sequence: r.read_u32()?,
            mtu: r.read_u32()?,
            flow_window: r.read_u32()?,
            handshake_type: r.read_u32()? as i32,
            socket_id: r.read_u32()?,
            syn_cookie: r.read_u32()?,
            ..Default::default()
        };
        cif.peer_ip.copy_from_slice(r.read_slice(16)?);
        while r.remaining() >= 4 {
            let ext_type = r.read_u16()?;
            let words = r.read_u16()? as usize;
            let payload = r.read_bytes(words * 4)?;
            cif.extensions.push((ext_type, payload));
        }
        Ok(cif)
    }

    pub fn marshal(&self) -> Bytes {
        let mut w = BytesMut::new();
        w.put_u32(self.version);
        w.put_u16(self.encryption);
        w.put_u16(self.extension);
        w.put_u32(self.initial_sequence);
        w.put_u32(self.mtu);
        w.put_u32(self.flow_window);
        w.put_u32(self.handshake_type as u32);
        w.put_u32(self.socket_id);
        w.put_u32(self.syn_cookie);
        w.put_slice(&self.peer_ip);
        for (ext_type, payload) in &self.extensions {
            debug_assert_eq!(payload.len() % 4, 0);
            w.put_u16(*ext_type);
            w.put_u16((payload.len() / 4) as u16);
            w.put_slice(payload);
        }
        w.freeze()
    }

    pub fn extension(&self, ext_type: u16) -> Option<&Bytes> {
        self.extensions
            .iter()
            .find(|(t, _)| *t == ext_type)
            .map(|(_, p)| p)
    }

    /// Decodes the stream id extension: characters travel reversed within
    /// each 32-bit word.
    pub fn stream_id(&self) -> Option<String> {
        let raw = self.extension(EXT_TYPE_STREAMID)?;
        let mut out = Vec::with_capacity(raw.len());
        for chunk in raw.chunks(4) {
            out.extend(chunk.iter().rev());
        }
        while out.last() == Some(&0) {
            out.pop();
        }
        String::from_utf8(out).ok()
    }
}

/// Encodes a stream id into the word-reversed wire form, zero padded.
pub fn encode_stream_id(stream_id: &str) -> Bytes {
    let mut bytes = stream_id.as_bytes().to_vec();
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    let mut out = BytesMut::with_capacity(bytes.len());
    for chunk in bytes.chunks(4) {
        out.extend(chunk.iter().rev());
    }
    out.freeze()
}

/// Parsed `#!::k=v,...` stream id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamId {
    pub host: String,
    pub resource: String,
    pub mode: SrtMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SrtMode {
    #[default]
    Publish,
    Request,
}

impl StreamId {
    /// `#!::h=host,r=app/stream,m=publish|request`
    pub fn parse(raw: &str) -> Result<Self> {
        let body = raw
            .strip_prefix("#!::")
            .ok_or_else(|| Error::SrtStreamId(format!("missing #!:: prefix: {raw}")))?;
        let mut id = StreamId::default();
        for kv in body.split(',') {
            let Some((k, v)) = kv.split_once('=') else {
                continue;
            };
            match k {
                "h" => id.host = v.to_string(),
                "r" => id.resource = v.to_string(),
                "m" => {
                    id.mode = match v {
                        "publish" => SrtMode::Publish,
                        "request" => SrtMode::Request,
                        other => {
                            return Err(Error::SrtStreamId(format!("unknown mode {other}")))
                        }
                    }
                }
                _ => {}
            }
        }
        if id.resource.is_empty() {
            return Err(Error::SrtStreamId("missing r= resource".into()));
        }
        Ok(id)
    }

    /// `app/stream` out of the resource.
    pub fn app_stream(&self) -> (String, String) {
        match self.resource.split_once('/') {
            Some((app, stream)) => (app.to_string(), stream.to_string()),
            None => ("live".to_string(), self.resource.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_packet_round_trip() {
        let p = SrtPacket::Data {
            sequence: 12345,
            message_flags: 0xE000_0001,
            timestamp: 1000,
            dest_socket_id: 7,
            payload: Bytes::from(vec![0x47; 188]),
        };
        assert_eq!(SrtPacket::unmarshal(&p.marshal()).unwrap(), p);
    }

    #[test]
    fn test_control_bit() {
        let p = SrtPacket::Control {
            control_type: CTRL_KEEPALIVE,
            subtype: 0,
            type_specific: 0,
            timestamp: 5,
            dest_socket_id: 9,
            cif: Bytes::new(),
        };
        let wire = p.marshal();
        assert_eq!(wire[0] & 0x80, 0x80);
        assert_eq!(SrtPacket::unmarshal(&wire).unwrap(), p);
    }

    #[test]
    fn test_handshake_cif_round_trip() {
        let mut cif = HandshakeCif {
            version: SRT_VERSION_5,
            extension: SRT_MAGIC,
            initial_sequence: 1000,
            mtu: 1500,
            flow_window: 8192,
            handshake_type: HS_TYPE_CONCLUSION,
            socket_id: 42,
            syn_cookie: 0xDEAD,
            ..Default::default()
        };
        cif.extensions
            .push((EXT_TYPE_STREAMID, encode_stream_id("#!::r=live/cam,m=publish")));
        let parsed = HandshakeCif::unmarshal(&cif.marshal()).unwrap();
        assert_eq!(parsed.version, SRT_VERSION_5);
        assert_eq!(parsed.handshake_type, HS_TYPE_CONCLUSION);
        assert_eq!(
            parsed.stream_id().as_deref(),
            Some("#!::r=live/cam,m=publish")
        );
    }

    #[test]
    fn test_stream_id_word_reversal() {
        // "abcd" encodes as "dcba" on the wire
        let enc = encode_stream_id("abcd");
        assert_eq!(enc.as_ref(), b"dcba");
    }

    #[test]
    fn test_stream_id_parse() {
        let id = StreamId::parse("#!::h=example.com,r=live/cam,m=request").unwrap();
        assert_eq!(id.host, "example.com");
        assert_eq!(id.mode, SrtMode::Request);
        assert_eq!(id.app_stream(), ("live".to_string(), "cam".to_string()));

        assert!(StreamId::parse("r=live/cam").is_err());
        assert!(StreamId::parse("#!::h=x").is_err());
        assert!(StreamId::parse("#!::r=s,m=bogus").is_err());
    }
}
