//! RTP fixed header and RFC 8285 header extensions.

use bytes::Bytes;
use shared::buffer::{BytesReader, BytesWriter};
use shared::error::{Error, Result};

/// Profile marker for RFC 8285 one-byte extensions.
pub const EXTENSION_PROFILE_ONE_BYTE: u16 = 0xBEDE;
/// Profile marker prefix for RFC 8285 two-byte extensions.
pub const EXTENSION_PROFILE_TWO_BYTE: u16 = 0x1000;

const HEADER_LEN: usize = 12;

/// One header extension element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub id: u8,
    pub payload: Bytes,
}

/// RTP packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub padding: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extension_profile: u16,
    pub extensions: Vec<Extension>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            padding: false,
            marker: false,
            payload_type: 0,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            csrc: Vec::new(),
            extension_profile: EXTENSION_PROFILE_ONE_BYTE,
            extensions: Vec::new(),
        }
    }
}

impl Header {
    /// Parses the header, returning it together with the number of bytes
    /// consumed (so the caller can slice the payload off zero-copy).
    pub fn unmarshal(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < HEADER_LEN {
            return Err(Error::RtpHeaderShort);
        }
        let mut r = BytesReader::new(data);
        let b0 = r.read_u8()?;
        let version = b0 >> 6;
        if version != 2 {
            return Err(Error::RtpHeaderShort);
        }
        let padding = (b0 >> 5) & 1 == 1;
        let has_extension = (b0 >> 4) & 1 == 1;
        let cc = (b0 & 0x0F) as usize;

        let b1 = r.read_u8()?;
        let marker = b1 >> 7 == 1;
        let payload_type = b1 & 0x7F;

        let sequence_number = r.read_u16()?;
        let timestamp = r.read_u32()?;
        let ssrc = r.read_u32()?;

        let mut csrc = Vec::with_capacity(cc);
        for _ in 0..cc {
            csrc.push(r.read_u32()?);
        }

        let mut extension_profile = EXTENSION_PROFILE_ONE_BYTE;
        let mut extensions = Vec::new();
        if has_extension {
            extension_profile = r.read_u16()?;
            let words = r.read_u16()? as usize;
            let ext = r.read_slice(words * 4)?;
            extensions = parse_extensions(extension_profile, ext)?;
        }

        Ok((
            Self {
                padding,
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
                csrc,
                extension_profile,
                extensions,
            },
            r.pos(),
        ))
    }

    pub fn marshal_to(&self, w: &mut BytesWriter) {
        let has_extension = !self.extensions.is_empty();
        let mut b0 = 2u8 << 6;
        if self.padding {
            b0 |= 1 << 5;
        }
        if has_extension {
            b0 |= 1 << 4;
        }
        b0 |= (self.csrc.len() as u8) & 0x0F;
        w.write_u8(b0);
        w.write_u8((self.marker as u8) << 7 | (self.payload_type & 0x7F));
        w.write_u16(self.sequence_number);
        w.write_u32(self.timestamp);
        w.write_u32(self.ssrc);
        for c in &self.csrc {
            w.write_u32(*c);
        }
        if has_extension {
            w.write_u16(self.extension_profile);
            let body = encode_extensions(self.extension_profile, &self.extensions);
            debug_assert_eq!(body.len() % 4, 0);
            w.write_u16((body.len() / 4) as u16);
            w.write_slice(&body);
        }
    }

    pub fn marshal_size(&self) -> usize {
        let mut n = HEADER_LEN + self.csrc.len() * 4;
        if !self.extensions.is_empty() {
            let body = encode_extensions(self.extension_profile, &self.extensions);
            n += 4 + body.len();
        }
        n
    }

    pub fn extension(&self, id: u8) -> Option<&Bytes> {
        self.extensions
            .iter()
            .find(|e| e.id == id)
            .map(|e| &e.payload)
    }

    pub fn set_extension(&mut self, id: u8, payload: Bytes) {
        if let Some(e) = self.extensions.iter_mut().find(|e| e.id == id) {
            e.payload = payload;
        } else {
            self.extensions.push(Extension { id, payload });
        }
    }
}

fn parse_extensions(profile: u16, data: &[u8]) -> Result<Vec<Extension>> {
    let mut out = Vec::new();
    let mut r = BytesReader::new(data);
    if profile == EXTENSION_PROFILE_ONE_BYTE {
        while !r.is_empty() {
            let b = r.read_u8()?;
            if b == 0 {
                continue; // padding
            }
            let id = b >> 4;
            if id == 0x0F {
                break; // reserved: stop processing
            }
            let len = (b & 0x0F) as usize + 1;
            out.push(Extension {
                id,
                payload: r.read_bytes(len)?,
            });
        }
    } else if profile >> 4 == EXTENSION_PROFILE_TWO_BYTE >> 4 {
        while r.remaining() >= 2 {
            let id = r.read_u8()?;
            if id == 0 {
                continue;
            }
            let len = r.read_u8()? as usize;
            out.push(Extension {
                id,
                payload: r.read_bytes(len)?,
            });
        }
    } else {
        // RFC 3550 generic extension: keep it opaque under id 0
        out.push(Extension {
            id: 0,
            payload: Bytes::copy_from_slice(data),
        });
    }
    Ok(out)
}

fn encode_extensions(profile: u16, extensions: &[Extension]) -> Vec<u8> {
    let mut body = Vec::new();
    if profile == EXTENSION_PROFILE_ONE_BYTE {
        for e in extensions {
            debug_assert!(e.id >= 1 && e.id <= 14);
            debug_assert!(!e.payload.is_empty() && e.payload.len() <= 16);
            body.push((e.id << 4) | ((e.payload.len() - 1) as u8 & 0x0F));
            body.extend_from_slice(&e.payload);
        }
    } else {
        for e in extensions {
            body.push(e.id);
            body.push(e.payload.len() as u8);
            body.extend_from_slice(&e.payload);
        }
    }
    while body.len() % 4 != 0 {
        body.push(0);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let h = Header {
            marker: true,
            payload_type: 96,
            sequence_number: 27023,
            timestamp: 3653407706,
            ssrc: 476325762,
            ..Default::default()
        };
        let mut w = BytesWriter::new();
        h.marshal_to(&mut w);
        let buf = w.freeze();
        let (parsed, consumed) = Header::unmarshal(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(parsed, h);
    }

    #[test]
    fn test_header_with_one_byte_extension() {
        let mut h = Header {
            payload_type: 111,
            sequence_number: 1,
            ssrc: 0x1234,
            ..Default::default()
        };
        h.set_extension(5, Bytes::from_static(&[0x00, 0x10]));
        let mut w = BytesWriter::new();
        h.marshal_to(&mut w);
        let buf = w.freeze();

        let (parsed, _) = Header::unmarshal(&buf).unwrap();
        assert_eq!(parsed.extension(5).unwrap().as_ref(), &[0x00, 0x10]);
        assert_eq!(parsed.marshal_size(), buf.len());
    }

    #[test]
    fn test_header_rejects_wrong_version() {
        let data = [0x00u8; 12];
        assert!(Header::unmarshal(&data).is_err());
    }

    #[test]
    fn test_header_short_fails() {
        let data = [0x80u8, 0x60, 0x00];
        assert!(Header::unmarshal(&data).is_err());
    }

    #[test]
    fn test_csrc_round_trip() {
        let h = Header {
            payload_type: 8,
            csrc: vec![1, 2, 3],
            ..Default::default()
        };
        let mut w = BytesWriter::new();
        h.marshal_to(&mut w);
        let (parsed, consumed) = Header::unmarshal(&w.freeze()).unwrap();
        assert_eq!(parsed.csrc, vec![1, 2, 3]);
        assert_eq!(consumed, 12 + 12);
    }
}
