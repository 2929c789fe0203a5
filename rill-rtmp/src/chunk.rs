//! RTMP chunk stream codec.
//!
//! The decoder is fed raw TCP bytes and yields complete messages; chunk
//! interleaving, all four header formats, extended timestamps and inbound
//! SetChunkSize/Abort protocol control are handled here so the connection
//! state machine only ever sees whole messages.

use crate::message::{RtmpMessage, MSG_ABORT, MSG_SET_CHUNK_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_CHUNK_SIZE: usize = 128;
/// Cap accepted from SetChunkSize; malicious peers do not get to make us
/// buffer unbounded chunks.
pub const MAX_CHUNK_SIZE: usize = 65536;

pub const CSID_PROTOCOL: u32 = 2;
pub const CSID_COMMAND: u32 = 3;
pub const CSID_MEDIA: u32 = 4;

const EXTENDED_TS_MARKER: u32 = 0xFF_FFFF;

#[derive(Default)]
struct ChunkStream {
    timestamp: u32,
    timestamp_delta: u32,
    message_length: usize,
    message_type: u8,
    message_stream_id: u32,
    extended_ts: bool,
    payload: BytesMut,
}

/// Streaming decoder: `extend_from_slice` then drain `poll_message`.
pub struct ChunkDecoder {
    buffer: BytesMut,
    in_chunk_size: usize,
    streams: HashMap<u32, ChunkStream>,
    out: VecDeque<RtmpMessage>,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            in_chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            out: VecDeque::new(),
        }
    }

    pub fn in_chunk_size(&self) -> usize {
        self.in_chunk_size
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete message, or `None` when more bytes are needed.
    pub fn poll_message(&mut self) -> Result<Option<RtmpMessage>> {
        loop {
            if let Some(msg) = self.out.pop_front() {
                return Ok(Some(msg));
            }
            if !self.parse_one_chunk()? {
                return Ok(None);
            }
        }
    }

    /// Parses a single chunk if fully buffered. Returns false when more
    /// data is required; consumed bytes are only committed for full chunks.
    fn parse_one_chunk(&mut self) -> Result<bool> {
        let buf = &self.buffer[..];
        if buf.is_empty() {
            return Ok(false);
        }

        // basic header: 1..3 bytes
        let b0 = buf[0];
        let fmt = b0 >> 6;
        let (csid, mut off) = match b0 & 0x3F {
            0 => {
                if buf.len() < 2 {
                    return Ok(false);
                }
                (64 + buf[1] as u32, 2)
            }
            1 => {
                if buf.len() < 3 {
                    return Ok(false);
                }
                (64 + buf[1] as u32 + buf[2] as u32 * 256, 3)
            }
            n => (n as u32, 1),
        };

        let header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        if buf.len() < off + header_len {
            return Ok(false);
        }

        let stream = self.streams.entry(csid).or_default();
        let starting_new_message = stream.payload.is_empty();
        if fmt > 0 && starting_new_message && stream.message_length == 0 {
            return Err(Error::ChunkDecode(format!(
                "fmt{fmt} chunk on fresh csid {csid}"
            )));
        }

        let mut ts_field = stream.timestamp_delta;
        let mut msg_len = stream.message_length;
        let mut msg_type = stream.message_type;
        let mut msg_sid = stream.message_stream_id;
        let mut extended = stream.extended_ts;

        if fmt <= 2 {
            ts_field = u32::from_be_bytes([0, buf[off], buf[off + 1], buf[off + 2]]);
            extended = ts_field == EXTENDED_TS_MARKER;
        }
        if fmt <= 1 {
            msg_len =
                u32::from_be_bytes([0, buf[off + 3], buf[off + 4], buf[off + 5]]) as usize;
            msg_type = buf[off + 6];
        }
        if fmt == 0 {
            msg_sid = u32::from_le_bytes([
                buf[off + 7],
                buf[off + 8],
                buf[off + 9],
                buf[off + 10],
            ]);
        }
        off += header_len;

        if extended {
            if buf.len() < off + 4 {
                return Ok(false);
            }
            ts_field = u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
            off += 4;
        }

        if msg_len > 16 * 1024 * 1024 {
            return Err(Error::ChunkDecode(format!("message of {msg_len} bytes")));
        }
        // a header update mid-message is a protocol violation; keep the
        // in-flight message's framing rather than underflow on it
        if !starting_new_message {
            msg_len = stream.message_length;
            msg_type = stream.message_type;
            msg_sid = stream.message_stream_id;
        }

        let chunk_payload = self.in_chunk_size.min(msg_len - stream.payload.len());
        if buf.len() < off + chunk_payload {
            return Ok(false);
        }

        // chunk fully buffered: commit
        if starting_new_message {
            match fmt {
                0 => {
                    stream.timestamp = ts_field;
                    stream.timestamp_delta = 0;
                }
                1 | 2 => {
                    stream.timestamp_delta = ts_field;
                    stream.timestamp = stream.timestamp.wrapping_add(ts_field);
                }
                _ => {
                    stream.timestamp =
                        stream.timestamp.wrapping_add(stream.timestamp_delta);
                }
            }
        }
        stream.message_length = msg_len;
        stream.message_type = msg_type;
        stream.message_stream_id = msg_sid;
        stream.extended_ts = extended;

        stream
            .payload
            .extend_from_slice(&self.buffer[off..off + chunk_payload]);
        let _ = self.buffer.split_to(off + chunk_payload);

        if stream.payload.len() == stream.message_length {
            let msg = RtmpMessage {
                message_type: stream.message_type,
                timestamp: stream.timestamp,
                stream_id: stream.message_stream_id,
                payload: std::mem::take(&mut stream.payload).freeze(),
            };
            self.apply_protocol_control(&msg)?;
            self.out.push_back(msg);
        }
        Ok(true)
    }

    fn apply_protocol_control(&mut self, msg: &RtmpMessage) -> Result<()> {
        match msg.message_type {
            MSG_SET_CHUNK_SIZE => {
                if msg.payload.len() < 4 {
                    return Err(Error::ChunkDecode("short SetChunkSize".into()));
                }
                let size = u32::from_be_bytes([
                    msg.payload[0],
                    msg.payload[1],
                    msg.payload[2],
                    msg.payload[3],
                ]) as usize
                    & 0x7FFF_FFFF;
                if size == 0 || size > MAX_CHUNK_SIZE {
                    return Err(Error::ChunkDecode(format!("chunk size {size}")));
                }
                self.in_chunk_size = size;
            }
            MSG_ABORT => {
                if msg.payload.len() >= 4 {
                    let csid = u32::from_be_bytes([
                        msg.payload[0],
                        msg.payload[1],
                        msg.payload[2],
                        msg.payload[3],
                    ]);
                    if let Some(s) = self.streams.get_mut(&csid) {
                        s.payload.clear();
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Encodes messages into fmt0 + fmt3 chunk sequences.
pub struct ChunkEncoder {
    out_chunk_size: usize,
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            out_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn set_chunk_size(&mut self, size: usize) {
        self.out_chunk_size = size.clamp(DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE);
    }

    pub fn out_chunk_size(&self) -> usize {
        self.out_chunk_size
    }

    pub fn encode(&self, msg: &RtmpMessage, csid: u32) -> Bytes {
        debug_assert!((2..64).contains(&csid), "single-byte basic header only");
        let extended = msg.timestamp >= EXTENDED_TS_MARKER;
        let ts_field = if extended {
            EXTENDED_TS_MARKER
        } else {
            msg.timestamp
        };

        let mut out = BytesMut::with_capacity(msg.payload.len() + 64);
        out.put_u8(csid as u8); // fmt0
        out.put_slice(&ts_field.to_be_bytes()[1..]);
        out.put_slice(&(msg.payload.len() as u32).to_be_bytes()[1..]);
        out.put_u8(msg.message_type);
        out.put_u32_le(msg.stream_id);
        if extended {
            out.put_u32(msg.timestamp);
        }

        let mut offset = 0;
        let mut first = true;
        while offset < msg.payload.len() || first {
            if !first {
                out.put_u8(0xC0 | csid as u8); // fmt3 continuation
                if extended {
                    out.put_u32(msg.timestamp);
                }
            }
            let end = (offset + self.out_chunk_size).min(msg.payload.len());
            out.put_slice(&msg.payload[offset..end]);
            offset = end;
            first = false;
        }
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MSG_AUDIO, MSG_COMMAND_AMF0, MSG_VIDEO};

    fn message(message_type: u8, timestamp: u32, len: usize) -> RtmpMessage {
        RtmpMessage {
            message_type,
            timestamp,
            stream_id: 1,
            payload: Bytes::from((0..len).map(|i| i as u8).collect::<Vec<_>>()),
        }
    }

    fn round_trip(msgs: &[RtmpMessage]) -> Vec<RtmpMessage> {
        let enc = ChunkEncoder::new();
        let mut dec = ChunkDecoder::new();
        for m in msgs {
            dec.extend_from_slice(&enc.encode(m, CSID_MEDIA));
        }
        let mut out = Vec::new();
        while let Some(m) = dec.poll_message().unwrap() {
            out.push(m);
        }
        out
    }

    #[test]
    fn test_small_message_round_trip() {
        let m = message(MSG_AUDIO, 40, 10);
        assert_eq!(round_trip(std::slice::from_ref(&m)), vec![m]);
    }

    #[test]
    fn test_message_larger_than_chunk_size_reassembled() {
        // 1000 bytes at a 128-byte chunk size: 8 chunks, exact payload back
        let m = message(MSG_VIDEO, 1000, 1000);
        let got = round_trip(std::slice::from_ref(&m));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, m.payload);
        assert_eq!(got[0].timestamp, 1000);
    }

    #[test]
    fn test_partial_feed() {
        let enc = ChunkEncoder::new();
        let m = message(MSG_VIDEO, 5, 300);
        let wire = enc.encode(&m, CSID_MEDIA);

        let mut dec = ChunkDecoder::new();
        for b in wire.chunks(7) {
            dec.extend_from_slice(b);
        }
        assert_eq!(dec.poll_message().unwrap().unwrap().payload, m.payload);
    }

    #[test]
    fn test_extended_timestamp_round_trip() {
        let m = message(MSG_VIDEO, 0x0100_0000, 200);
        let got = round_trip(std::slice::from_ref(&m));
        assert_eq!(got[0].timestamp, 0x0100_0000);
        assert_eq!(got[0].payload, m.payload);
    }

    #[test]
    fn test_set_chunk_size_applies() {
        let mut enc = ChunkEncoder::new();
        let mut dec = ChunkDecoder::new();

        let set = RtmpMessage::set_chunk_size(4096);
        dec.extend_from_slice(&enc.encode(&set, CSID_PROTOCOL));
        assert!(dec.poll_message().unwrap().is_some());
        assert_eq!(dec.in_chunk_size(), 4096);

        enc.set_chunk_size(4096);
        let m = message(MSG_VIDEO, 1, 5000); // now only 2 chunks
        dec.extend_from_slice(&enc.encode(&m, CSID_MEDIA));
        assert_eq!(dec.poll_message().unwrap().unwrap().payload, m.payload);
    }

    #[test]
    fn test_fmt3_on_fresh_stream_fails() {
        let mut dec = ChunkDecoder::new();
        dec.extend_from_slice(&[0xC0 | 5]);
        assert!(dec.poll_message().is_err());
    }

    #[test]
    fn test_interleaved_streams() {
        let enc = ChunkEncoder::new();
        let mut dec = ChunkDecoder::new();
        let audio = message(MSG_AUDIO, 10, 20);
        let cmd = message(MSG_COMMAND_AMF0, 0, 30);
        // different csids interleave freely between chunks
        dec.extend_from_slice(&enc.encode(&audio, CSID_MEDIA));
        dec.extend_from_slice(&enc.encode(&cmd, CSID_COMMAND));
        let a = dec.poll_message().unwrap().unwrap();
        let b = dec.poll_message().unwrap().unwrap();
        assert_eq!(a.message_type, MSG_AUDIO);
        assert_eq!(b.message_type, MSG_COMMAND_AMF0);
    }

    #[test]
    fn test_delta_timestamps_accumulate() {
        // hand-build fmt0 then fmt1 chunks on one csid
        let mut wire = BytesMut::new();
        // fmt0: ts=100, len=2, type=8, sid=1
        wire.put_u8(4);
        wire.put_slice(&100u32.to_be_bytes()[1..]);
        wire.put_slice(&2u32.to_be_bytes()[1..]);
        wire.put_u8(MSG_AUDIO);
        wire.put_u32_le(1);
        wire.put_slice(&[0xAA, 0xBB]);
        // fmt1: delta=40, len=2, type=8
        wire.put_u8(0x40 | 4);
        wire.put_slice(&40u32.to_be_bytes()[1..]);
        wire.put_slice(&2u32.to_be_bytes()[1..]);
        wire.put_u8(MSG_AUDIO);
        wire.put_slice(&[0xCC, 0xDD]);
        // fmt3: another message, same delta
        wire.put_u8(0xC0 | 4);
        wire.put_slice(&[0xEE, 0xFF]);

        let mut dec = ChunkDecoder::new();
        dec.extend_from_slice(&wire);
        let m1 = dec.poll_message().unwrap().unwrap();
        let m2 = dec.poll_message().unwrap().unwrap();
        let m3 = dec.poll_message().unwrap().unwrap();
        assert_eq!(m1.timestamp, 100);
        assert_eq!(m2.timestamp, 140);
        assert_eq!(m3.timestamp, 180);
    }
}
