//! FLV stream framing: the 9-byte file header and tag encoding, as written
//! to HTTP-FLV subscribers and DVR segments.

use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

pub const TAG_AUDIO: u8 = 8;
pub const TAG_VIDEO: u8 = 9;
pub const TAG_SCRIPT: u8 = 18;

const TAG_HEADER_LEN: usize = 11;

/// FLV file header plus the leading zero PreviousTagSize.
pub fn flv_header(has_audio: bool, has_video: bool) -> Bytes {
    let mut w = BytesMut::with_capacity(13);
    w.put_slice(b"FLV");
    w.put_u8(1);
    w.put_u8(((has_audio as u8) << 2) | has_video as u8);
    w.put_u32(9);
    w.put_u32(0); // PreviousTagSize0
    w.freeze()
}

/// One tag with its trailing PreviousTagSize.
pub fn encode_tag(tag_type: u8, timestamp: u32, payload: &[u8]) -> Bytes {
    let mut w = BytesMut::with_capacity(TAG_HEADER_LEN + payload.len() + 4);
    w.put_u8(tag_type);
    w.put_slice(&(payload.len() as u32).to_be_bytes()[1..]);
    w.put_slice(&timestamp.to_be_bytes()[1..]);
    w.put_u8((timestamp >> 24) as u8); // timestamp extended
    w.put_slice(&[0, 0, 0]); // stream id
    w.put_slice(payload);
    w.put_u32((TAG_HEADER_LEN + payload.len()) as u32);
    w.freeze()
}

/// A parsed tag, used by tests and the DVR reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub tag_type: u8,
    pub timestamp: u32,
    pub payload: Bytes,
}

/// Streaming tag reader over a previously written FLV byte stream.
pub struct TagReader {
    data: Bytes,
    pos: usize,
}

impl TagReader {
    /// Positions past the file header; fails when the signature is wrong.
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < 13 || &data[..3] != b"FLV" {
            return Err(Error::FlvDecode("bad flv signature".into()));
        }
        let offset = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
        Ok(Self {
            data,
            pos: offset + 4,
        })
    }

    pub fn next_tag(&mut self) -> Result<Option<Tag>> {
        if self.pos + TAG_HEADER_LEN > self.data.len() {
            return Ok(None);
        }
        let d = &self.data[self.pos..];
        let tag_type = d[0];
        let size = u32::from_be_bytes([0, d[1], d[2], d[3]]) as usize;
        let timestamp =
            u32::from_be_bytes([d[7], d[4], d[5], d[6]]);
        let total = TAG_HEADER_LEN + size + 4;
        if self.pos + total > self.data.len() {
            return Err(Error::FlvDecode("truncated tag".into()));
        }
        let payload = self
            .data
            .slice(self.pos + TAG_HEADER_LEN..self.pos + TAG_HEADER_LEN + size);
        self.pos += total;
        Ok(Some(Tag {
            tag_type,
            timestamp,
            payload,
        }))
    }
}
