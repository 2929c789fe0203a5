//! MPEG transport stream demux: PAT/PMT discovery and PES reassembly into
//! elementary stream frames.

use crate::TS_PACKET_SIZE;
use bytes::{Bytes, BytesMut};
use log::trace;
use shared::error::{Error, Result};
use std::collections::HashMap;

pub const STREAM_TYPE_MP3_1: u8 = 0x03;
pub const STREAM_TYPE_MP3_2: u8 = 0x04;
pub const STREAM_TYPE_AAC_ADTS: u8 = 0x0F;
pub const STREAM_TYPE_H264: u8 = 0x1B;
pub const STREAM_TYPE_HEVC: u8 = 0x24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    Hevc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    AacAdts,
    Mp3,
}

/// One reassembled elementary-stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EsFrame {
    /// Annex-B video access unit with 90 kHz PTS/DTS.
    Video {
        codec: VideoCodec,
        pts: u64,
        dts: u64,
        data: Bytes,
    },
    /// Audio payload (ADTS frames or MP3) with 90 kHz PTS.
    Audio {
        codec: AudioCodec,
        pts: u64,
        data: Bytes,
    },
}

enum PesKind {
    Video(VideoCodec),
    Audio(AudioCodec),
}

struct PesStream {
    kind: PesKind,
    buffer: BytesMut,
    pts: u64,
    dts: u64,
    assembling: bool,
}

/// Streaming TS demuxer; feed 188-byte packets, collect [EsFrame]s.
#[derive(Default)]
pub struct TsDemuxer {
    pmt_pid: Option<u16>,
    streams: HashMap<u16, PesStream>,
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one 188-byte packet.
    pub fn feed(&mut self, packet: &[u8]) -> Result<Vec<EsFrame>> {
        if packet.len() != TS_PACKET_SIZE {
            return Err(Error::TsDecode(format!(
                "packet of {} bytes",
                packet.len()
            )));
        }
        if packet[0] != 0x47 {
            return Err(Error::TsDecode("missing sync byte".into()));
        }
        let pusi = packet[1] & 0x40 != 0;
        let pid = (u16::from(packet[1] & 0x1F) << 8) | u16::from(packet[2]);
        let adaptation = (packet[3] >> 4) & 0x03;

        let mut off = 4;
        if adaptation == 2 || adaptation == 3 {
            let len = packet[4] as usize;
            off += 1 + len;
            if off > TS_PACKET_SIZE {
                return Err(Error::TsDecode("adaptation field overruns".into()));
            }
        }
        if adaptation == 2 || off >= TS_PACKET_SIZE {
            return Ok(Vec::new()); // no payload
        }
        let payload = &packet[off..];

        if pid == 0 {
            self.parse_pat(payload, pusi)?;
            return Ok(Vec::new());
        }
        if Some(pid) == self.pmt_pid {
            self.parse_pmt(payload, pusi)?;
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        if let Some(stream) = self.streams.get_mut(&pid) {
            if pusi {
                if let Some(frame) = stream.take_frame() {
                    out.push(frame);
                }
                stream.begin_pes(payload)?;
            } else if stream.assembling {
                stream.buffer.extend_from_slice(payload);
            }
        }
        Ok(out)
    }

    /// Flushes any partially assembled frames (end of stream).
    pub fn flush(&mut self) -> Vec<EsFrame> {
        self.streams
            .values_mut()
            .filter_map(|s| s.take_frame())
            .collect()
    }

    fn parse_pat(&mut self, payload: &[u8], pusi: bool) -> Result<()> {
        let table = section_payload(payload, pusi)?;
        if table.len() < 12 || table[0] != 0x00 {
            return Ok(());
        }
        let section_len = ((table[1] as usize & 0x0F) << 8) | table[2] as usize;
        // entries run from byte 8 to section end minus CRC
        let end = (3 + section_len).min(table.len()).saturating_sub(4);
        let mut off = 8;
        while off + 4 <= end {
            let program = (u16::from(table[off]) << 8) | u16::from(table[off + 1]);
            let pid = (u16::from(table[off + 2] & 0x1F) << 8) | u16::from(table[off + 3]);
            if program != 0 {
                self.pmt_pid = Some(pid);
            }
            off += 4;
        }
        Ok(())
    }

    fn parse_pmt(&mut self, payload: &[u8], pusi: bool) -> Result<()> {
        let table = section_payload(payload, pusi)?;
        if table.len() < 12 || table[0] != 0x02 {
            return Ok(());
        }
        let section_len = ((table[1] as usize & 0x0F) << 8) | table[2] as usize;
        let end = (3 + section_len).min(table.len()).saturating_sub(4);
        let program_info_len = ((table[10] as usize & 0x0F) << 8) | table[11] as usize;
        let mut off = 12 + program_info_len;
        while off + 5 <= end {
            let stream_type = table[off];
            let pid = (u16::from(table[off + 1] & 0x1F) << 8) | u16::from(table[off + 2]);
            let es_info_len = ((table[off + 3] as usize & 0x0F) << 8) | table[off + 4] as usize;
            off += 5 + es_info_len;

            let kind = match stream_type {
                STREAM_TYPE_H264 => Some(PesKind::Video(VideoCodec::H264)),
                STREAM_TYPE_HEVC => Some(PesKind::Video(VideoCodec::Hevc)),
                STREAM_TYPE_AAC_ADTS => Some(PesKind::Audio(AudioCodec::AacAdts)),
                STREAM_TYPE_MP3_1 | STREAM_TYPE_MP3_2 => {
                    Some(PesKind::Audio(AudioCodec::Mp3))
                }
                other => {
                    trace!("pmt: ignoring stream type {other:#04x} on pid {pid}");
                    None
                }
            };
            if let Some(kind) = kind {
                self.streams.entry(pid).or_insert(PesStream {
                    kind,
                    buffer: BytesMut::new(),
                    pts: 0,
                    dts: 0,
                    assembling: false,
                });
            }
        }
        Ok(())
    }
}

impl PesStream {
    fn take_frame(&mut self) -> Option<EsFrame> {
        if !self.assembling || self.buffer.is_empty() {
            self.assembling = false;
            return None;
        }
        self.assembling = false;
        let data = std::mem::take(&mut self.buffer).freeze();
        Some(match &self.kind {
            PesKind::Video(codec) => EsFrame::Video {
                codec: *codec,
                pts: self.pts,
                dts: self.dts,
                data,
            },
            PesKind::Audio(codec) => EsFrame::Audio {
                codec: *codec,
                pts: self.pts,
                data,
            },
        })
    }

    fn begin_pes(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() < 9 || payload[0] != 0 || payload[1] != 0 || payload[2] != 1 {
            return Err(Error::TsDecode("bad pes start code".into()));
        }
        let flags = payload[7];
        let header_len = payload[8] as usize;
        let data_off = 9 + header_len;
        if data_off > payload.len() {
            return Err(Error::TsDecode("pes header overruns".into()));
        }
        if flags & 0x80 != 0 && header_len >= 5 {
            self.pts = decode_pts(&payload[9..14]);
            self.dts = if flags & 0x40 != 0 && header_len >= 10 {
                decode_pts(&payload[14..19])
            } else {
                self.pts
            };
        }
        self.buffer.clear();
        self.buffer.extend_from_slice(&payload[data_off..]);
        self.assembling = true;
        Ok(())
    }
}

/// Skips the pointer field on section-carrying packets.
fn section_payload<'a>(payload: &'a [u8], pusi: bool) -> Result<&'a [u8]> {
    if !pusi {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(Error::TsDecode("empty section".into()));
    }
    let pointer = payload[0] as usize;
    if 1 + pointer > payload.len() {
        return Err(Error::TsDecode("section pointer overruns".into()));
    }
    Ok(&payload[1 + pointer..])
}

pub(crate) fn decode_pts(b: &[u8]) -> u64 {
    ((b[0] as u64 & 0x0E) << 29)
        | ((b[1] as u64) << 22)
        | ((b[2] as u64 & 0xFE) << 14)
        | ((b[3] as u64) << 7)
        | ((b[4] as u64) >> 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::TsMuxer;

    #[test]
    fn test_rejects_bad_packets() {
        let mut d = TsDemuxer::new();
        assert!(d.feed(&[0u8; 10]).is_err());
        let mut pkt = [0u8; TS_PACKET_SIZE];
        pkt[0] = 0x48;
        assert!(d.feed(&pkt).is_err());
    }

    #[test]
    fn test_mux_demux_video_and_audio() {
        // round trip through our own muxer
        let mut m = TsMuxer::new();
        let mut d = TsDemuxer::new();

        let video: Bytes = {
            let mut v = vec![0, 0, 0, 1, 0x65];
            v.extend(std::iter::repeat(0x11).take(400));
            Bytes::from(v)
        };
        let audio = Bytes::from(vec![0xFFu8; 64]);

        let mut frames = Vec::new();
        let wire = m.mux_video(90_000, 90_000, true, &video);
        for pkt in wire.chunks(TS_PACKET_SIZE) {
            frames.extend(d.feed(pkt).unwrap());
        }
        let wire = m.mux_audio(91_000, &audio);
        for pkt in wire.chunks(TS_PACKET_SIZE) {
            frames.extend(d.feed(pkt).unwrap());
        }
        frames.extend(d.flush());

        assert_eq!(frames.len(), 2);
        match &frames[0] {
            EsFrame::Video {
                codec, pts, data, ..
            } => {
                assert_eq!(*codec, VideoCodec::H264);
                assert_eq!(*pts, 90_000);
                assert_eq!(data, &video);
            }
            other => panic!("expected video, got {other:?}"),
        }
        match &frames[1] {
            EsFrame::Audio { codec, pts, data } => {
                assert_eq!(*codec, AudioCodec::AacAdts);
                assert_eq!(*pts, 91_000);
                assert_eq!(data, &audio);
            }
            other => panic!("expected audio, got {other:?}"),
        }
    }

    #[test]
    fn test_pts_codec() {
        let pts = 0x1_2345_6789u64 & 0x1_FFFF_FFFF;
        let mut b = [0u8; 5];
        crate::mux::encode_pts(&mut b, 0x2, pts);
        assert_eq!(decode_pts(&b), pts);
    }
}
