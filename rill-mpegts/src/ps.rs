//! MPEG program stream demux for the GB28181 PS-over-TCP media channel.
//!
//! Each framed chunk carries a pack header (000001BA), optionally a system
//! header and a program stream map, then PES packets (000001E0 video,
//! 000001C0 audio).

use crate::demux::{decode_pts, AudioCodec, EsFrame, VideoCodec};
use bytes::{Bytes, BytesMut};
use shared::error::{Error, Result};

const PACK_START: u32 = 0x0000_01BA;
const SYSTEM_HEADER: u32 = 0x0000_01BB;
const PSM: u32 = 0x0000_01BC;

/// PSM stream types mirror the TS ones.
const PSM_TYPE_H264: u8 = 0x1B;
const PSM_TYPE_HEVC: u8 = 0x24;
const PSM_TYPE_AAC: u8 = 0x0F;
const PSM_TYPE_G711A: u8 = 0x90;

/// Streaming PS demuxer: feed framed pack data, collect ES frames.
///
/// Video PES packets for one access unit are merged until the next video
/// PES with a PTS (or the next pack) begins.
pub struct PsDemuxer {
    video_codec: VideoCodec,
    audio_codec: Option<AudioCodec>,
    video_buffer: BytesMut,
    video_pts: u64,
    video_dts: u64,
    video_assembling: bool,
}

impl Default for PsDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl PsDemuxer {
    pub fn new() -> Self {
        Self {
            video_codec: VideoCodec::H264,
            audio_codec: None,
            video_buffer: BytesMut::new(),
            video_pts: 0,
            video_dts: 0,
            video_assembling: false,
        }
    }

    /// Feeds one framed chunk (one or more packs / PES packets).
    pub fn feed(&mut self, data: &Bytes) -> Result<Vec<EsFrame>> {
        let mut out = Vec::new();
        let mut off = 0usize;
        while off + 4 <= data.len() {
            let code = u32::from_be_bytes([
                data[off],
                data[off + 1],
                data[off + 2],
                data[off + 3],
            ]);
            match code {
                PACK_START => {
                    if off + 14 > data.len() {
                        break;
                    }
                    let stuffing = (data[off + 13] & 0x07) as usize;
                    off += 14 + stuffing;
                }
                SYSTEM_HEADER => {
                    off = self.skip_section(data, off)?;
                }
                PSM => {
                    let end = self.skip_section(data, off)?;
                    self.parse_psm(&data[off + 6..end])?;
                    off = end;
                }
                code if (0x0000_01E0..=0x0000_01EF).contains(&code) => {
                    let (payload, pts, dts, end) = parse_pes(data, off)?;
                    if pts.is_some() {
                        if let Some(f) = self.take_video() {
                            out.push(f);
                        }
                        self.video_pts = pts.unwrap_or(self.video_pts);
                        self.video_dts = dts.unwrap_or(self.video_pts);
                        self.video_assembling = true;
                    }
                    if self.video_assembling {
                        self.video_buffer.extend_from_slice(&payload);
                    }
                    off = end;
                }
                code if (0x0000_01C0..=0x0000_01DF).contains(&code) => {
                    let (payload, pts, _dts, end) = parse_pes(data, off)?;
                    if !payload.is_empty() {
                        out.push(EsFrame::Audio {
                            codec: self.audio_codec.unwrap_or(AudioCodec::AacAdts),
                            pts: pts.unwrap_or(0),
                            data: payload,
                        });
                    }
                    off = end;
                }
                _ => {
                    // resync to the next start code
                    match find_start_code(&data[off + 1..]) {
                        Some(n) => off += 1 + n,
                        None => break,
                    }
                }
            }
        }
        Ok(out)
    }

    /// Flushes a pending video access unit (call at pack boundaries).
    pub fn flush(&mut self) -> Option<EsFrame> {
        self.take_video()
    }

    fn take_video(&mut self) -> Option<EsFrame> {
        if !self.video_assembling || self.video_buffer.is_empty() {
            self.video_assembling = false;
            return None;
        }
        self.video_assembling = false;
        Some(EsFrame::Video {
            codec: self.video_codec,
            pts: self.video_pts,
            dts: self.video_dts,
            data: std::mem::take(&mut self.video_buffer).freeze(),
        })
    }

    fn parse_psm(&mut self, body: &[u8]) -> Result<()> {
        // skip current_next/version (2), program_stream_info
        if body.len() < 6 {
            return Ok(());
        }
        let info_len = ((body[2] as usize) << 8) | body[3] as usize;
        let mut off = 4 + info_len;
        if off + 2 > body.len() {
            return Ok(());
        }
        let map_len = ((body[off] as usize) << 8) | body[off + 1] as usize;
        off += 2;
        let end = (off + map_len).min(body.len());
        while off + 4 <= end {
            let stream_type = body[off];
            let stream_id = body[off + 1];
            let es_len = ((body[off + 2] as usize) << 8) | body[off + 3] as usize;
            off += 4 + es_len;
            if (0xE0..=0xEF).contains(&stream_id) {
                self.video_codec = match stream_type {
                    PSM_TYPE_HEVC => VideoCodec::Hevc,
                    PSM_TYPE_H264 => VideoCodec::H264,
                    other => {
                        return Err(Error::PsDecode(format!(
                            "unsupported video stream type {other:#04x}"
                        )))
                    }
                };
            } else if (0xC0..=0xDF).contains(&stream_id) {
                self.audio_codec = match stream_type {
                    PSM_TYPE_AAC => Some(AudioCodec::AacAdts),
                    PSM_TYPE_G711A => None, // transcoded upstream, dropped here
                    _ => None,
                };
            }
        }
        Ok(())
    }

    /// Sections with a 16-bit length after the start code.
    fn skip_section(&self, data: &Bytes, off: usize) -> Result<usize> {
        if off + 6 > data.len() {
            return Err(Error::PsDecode("truncated section".into()));
        }
        let len = ((data[off + 4] as usize) << 8) | data[off + 5] as usize;
        let end = off + 6 + len;
        if end > data.len() {
            return Err(Error::PsDecode("section overruns buffer".into()));
        }
        Ok(end)
    }
}

fn find_start_code(data: &[u8]) -> Option<usize> {
    data.windows(3).position(|w| w == [0, 0, 1]).map(|p| {
        // back up to include a leading zero of a 4-byte code
        p.saturating_sub(1)
    })
}

#[allow(clippy::type_complexity)]
fn parse_pes(
    data: &Bytes,
    off: usize,
) -> Result<(Bytes, Option<u64>, Option<u64>, usize)> {
    if off + 9 > data.len() {
        return Err(Error::PsDecode("truncated pes".into()));
    }
    let pes_len = ((data[off + 4] as usize) << 8) | data[off + 5] as usize;
    let end = off + 6 + pes_len;
    if pes_len == 0 || end > data.len() {
        return Err(Error::PsDecode("pes length overruns buffer".into()));
    }
    let flags = data[off + 7];
    let header_len = data[off + 8] as usize;
    let data_off = off + 9 + header_len;
    if data_off > end {
        return Err(Error::PsDecode("pes header overruns".into()));
    }
    let mut pts = None;
    let mut dts = None;
    if flags & 0x80 != 0 && header_len >= 5 {
        pts = Some(decode_pts(&data[off + 9..off + 14]));
        if flags & 0x40 != 0 && header_len >= 10 {
            dts = Some(decode_pts(&data[off + 14..off + 19]));
        }
    }
    Ok((data.slice(data_off..end), pts, dts, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn pack_header() -> BytesMut {
        let mut b = BytesMut::new();
        b.put_u32(PACK_START);
        // SCR (6 bytes) + mux rate (3) + stuffing count 0
        b.put_slice(&[0x44, 0, 0, 0x04, 0, 0, 0, 0, 0, 0xF8]);
        b
    }

    fn pes(stream_id: u8, pts: Option<u64>, payload: &[u8]) -> BytesMut {
        let mut b = BytesMut::new();
        b.put_slice(&[0, 0, 1, stream_id]);
        let header_len = if pts.is_some() { 5 } else { 0 };
        b.put_u16((3 + header_len + payload.len()) as u16);
        b.put_u8(0x80);
        b.put_u8(if pts.is_some() { 0x80 } else { 0 });
        b.put_u8(header_len as u8);
        if let Some(p) = pts {
            let mut ts = [0u8; 5];
            crate::mux::encode_pts(&mut ts, 0x2, p);
            b.put_slice(&ts);
        }
        b.put_slice(payload);
        b
    }

    fn psm(video_type: u8) -> BytesMut {
        let mut b = BytesMut::new();
        b.put_u32(PSM);
        let body: &[u8] = &[
            0xE0, 0xFF, // current_next + version
            0x00, 0x00, // program_stream_info_length
            0x00, 0x08, // elementary_stream_map_length
            video_type, 0xE0, 0x00, 0x00, // video entry
            PSM_TYPE_AAC, 0xC0, 0x00, 0x00, // audio entry
        ];
        b.put_u16(body.len() as u16);
        b.put_slice(body);
        b
    }

    #[test]
    fn test_ps_video_and_audio() {
        let mut d = PsDemuxer::new();
        let mut wire = pack_header();
        wire.extend_from_slice(&psm(PSM_TYPE_H264));
        wire.extend_from_slice(&pes(0xE0, Some(3600), &[0, 0, 0, 1, 0x65, 1, 2]));
        wire.extend_from_slice(&pes(0xE0, None, &[3, 4])); // continuation
        wire.extend_from_slice(&pes(0xC0, Some(3700), &[0xFF, 0xF1, 9]));

        let mut frames = d.feed(&wire.freeze()).unwrap();
        frames.extend(d.flush());

        // audio surfaces immediately, video on flush
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            EsFrame::Audio { pts, .. } => assert_eq!(*pts, 3700),
            other => panic!("expected audio, got {other:?}"),
        }
        match &frames[1] {
            EsFrame::Video {
                codec, pts, data, ..
            } => {
                assert_eq!(*codec, VideoCodec::H264);
                assert_eq!(*pts, 3600);
                assert_eq!(data.as_ref(), &[0, 0, 0, 1, 0x65, 1, 2, 3, 4]);
            }
            other => panic!("expected video, got {other:?}"),
        }
    }

    #[test]
    fn test_ps_next_pts_flushes_previous() {
        let mut d = PsDemuxer::new();
        let mut wire = pack_header();
        wire.extend_from_slice(&psm(PSM_TYPE_H264));
        wire.extend_from_slice(&pes(0xE0, Some(0), &[1]));
        wire.extend_from_slice(&pes(0xE0, Some(3600), &[2]));
        let frames = d.feed(&wire.freeze()).unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            EsFrame::Video { pts, data, .. } => {
                assert_eq!(*pts, 0);
                assert_eq!(data.as_ref(), &[1]);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_psm_selects_hevc() {
        let mut d = PsDemuxer::new();
        let mut wire = pack_header();
        wire.extend_from_slice(&psm(PSM_TYPE_HEVC));
        wire.extend_from_slice(&pes(0xE0, Some(100), &[9]));
        d.feed(&wire.freeze()).unwrap();
        match d.flush().unwrap() {
            EsFrame::Video { codec, .. } => assert_eq!(codec, VideoCodec::Hevc),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_garbage_resync() {
        let mut d = PsDemuxer::new();
        let mut wire = BytesMut::new();
        wire.put_slice(&[9, 9, 9, 9]);
        wire.extend_from_slice(&pack_header());
        wire.extend_from_slice(&psm(PSM_TYPE_H264));
        wire.extend_from_slice(&pes(0xC0, Some(1), &[0xAA]));
        let frames = d.feed(&wire.freeze()).unwrap();
        assert_eq!(frames.len(), 1);
    }
}
