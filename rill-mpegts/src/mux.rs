//! Transport stream mux for the HTTP-TS output path: one program, one H.264
//! stream and one AAC stream, PAT/PMT repeated ahead of every keyframe.

use crate::demux::{STREAM_TYPE_AAC_ADTS, STREAM_TYPE_H264};
use crate::TS_PACKET_SIZE;
use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_MPEG_2};
use std::collections::HashMap;

const CRC32_MPEG: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

pub const PID_PMT: u16 = 0x1000;
pub const PID_VIDEO: u16 = 0x0100;
pub const PID_AUDIO: u16 = 0x0101;

/// Stateful single-program TS muxer.
pub struct TsMuxer {
    continuity: HashMap<u16, u8>,
    wrote_psi: bool,
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsMuxer {
    pub fn new() -> Self {
        Self {
            continuity: HashMap::new(),
            wrote_psi: false,
        }
    }

    /// Muxes one Annex-B video access unit. PSI and a PCR ride along on
    /// keyframes.
    pub fn mux_video(&mut self, pts: u64, dts: u64, keyframe: bool, data: &Bytes) -> Bytes {
        let mut out = BytesMut::new();
        if keyframe || !self.wrote_psi {
            self.write_psi(&mut out);
        }
        let pes = pes_packet(0xE0, pts, dts, data);
        self.write_pes(&mut out, PID_VIDEO, &pes, keyframe.then_some(dts));
        out.freeze()
    }

    /// Muxes audio (ADTS frames) at `pts`.
    pub fn mux_audio(&mut self, pts: u64, data: &Bytes) -> Bytes {
        let mut out = BytesMut::new();
        if !self.wrote_psi {
            self.write_psi(&mut out);
        }
        let pes = pes_packet(0xC0, pts, pts, data);
        self.write_pes(&mut out, PID_AUDIO, &pes, None);
        out.freeze()
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let cc = self.continuity.entry(pid).or_insert(0);
        let v = *cc;
        *cc = (*cc + 1) & 0x0F;
        v
    }

    fn write_psi(&mut self, out: &mut BytesMut) {
        self.wrote_psi = true;

        // PAT: program 1 -> PID_PMT
        let mut pat = BytesMut::new();
        pat.put_u8(0x00); // table id
        let body_len = 9 + 4; // fixed part after length + one entry + crc
        pat.put_u16(0xB000 | body_len as u16);
        pat.put_u16(1); // transport stream id
        pat.put_u8(0xC1); // version 0, current
        pat.put_u8(0); // section number
        pat.put_u8(0); // last section number
        pat.put_u16(1); // program number
        pat.put_u16(0xE000 | PID_PMT);
        let crc = CRC32_MPEG.checksum(&pat);
        pat.put_u32(crc);
        self.write_section(out, 0, &pat);

        // PMT: H.264 + AAC
        let mut pmt = BytesMut::new();
        pmt.put_u8(0x02);
        let body_len = 9 + 5 + 5 + 4;
        pmt.put_u16(0xB000 | body_len as u16);
        pmt.put_u16(1); // program number
        pmt.put_u8(0xC1);
        pmt.put_u8(0);
        pmt.put_u8(0);
        pmt.put_u16(0xE000 | PID_VIDEO); // PCR PID
        pmt.put_u16(0xF000); // program info length
        pmt.put_u8(STREAM_TYPE_H264);
        pmt.put_u16(0xE000 | PID_VIDEO);
        pmt.put_u16(0xF000);
        pmt.put_u8(STREAM_TYPE_AAC_ADTS);
        pmt.put_u16(0xE000 | PID_AUDIO);
        pmt.put_u16(0xF000);
        let crc = CRC32_MPEG.checksum(&pmt);
        pmt.put_u32(crc);
        self.write_section(out, PID_PMT, &pmt);
    }

    fn write_section(&mut self, out: &mut BytesMut, pid: u16, section: &[u8]) {
        let mut pkt = BytesMut::with_capacity(TS_PACKET_SIZE);
        pkt.put_u8(0x47);
        pkt.put_u16(0x4000 | pid); // PUSI set
        pkt.put_u8(0x10 | self.next_cc(pid)); // payload only
        pkt.put_u8(0); // pointer field
        pkt.extend_from_slice(section);
        while pkt.len() < TS_PACKET_SIZE {
            pkt.put_u8(0xFF);
        }
        out.extend_from_slice(&pkt);
    }

    /// Splits a PES packet across 188-byte packets; the first one may carry
    /// a PCR in its adaptation field, the last one is stuffed out.
    fn write_pes(&mut self, out: &mut BytesMut, pid: u16, pes: &[u8], pcr_dts: Option<u64>) {
        let mut off = 0;
        let mut first = true;
        while off < pes.len() {
            let mut pkt = BytesMut::with_capacity(TS_PACKET_SIZE);
            pkt.put_u8(0x47);
            let pusi = if first { 0x4000 } else { 0 };
            pkt.put_u16(pusi | pid);

            let remaining = pes.len() - off;
            let mut header_room = 4usize;
            let pcr = if first { pcr_dts } else { None };

            // adaptation field needed for PCR or stuffing; af_len is chosen
            // so header + field + payload land exactly on 188 bytes
            let adaptation_len = if pcr.is_some() {
                Some(7.max(183usize.saturating_sub(remaining)))
            } else if remaining < TS_PACKET_SIZE - header_room {
                Some(183 - remaining)
            } else {
                None
            };

            match adaptation_len {
                Some(af_len) => {
                    pkt.put_u8(0x30 | self.next_cc(pid));
                    pkt.put_u8(af_len as u8);
                    if af_len > 0 {
                        let mut flags = 0u8;
                        if let Some(dts) = pcr {
                            flags |= 0x10; // PCR flag
                            pkt.put_u8(flags);
                            put_pcr(&mut pkt, dts);
                            for _ in 0..af_len - 7 {
                                pkt.put_u8(0xFF);
                            }
                        } else {
                            pkt.put_u8(flags);
                            for _ in 0..af_len - 1 {
                                pkt.put_u8(0xFF);
                            }
                        }
                    }
                    header_room += 1 + af_len;
                }
                None => {
                    pkt.put_u8(0x10 | self.next_cc(pid));
                }
            }

            let take = (TS_PACKET_SIZE - header_room).min(remaining);
            pkt.extend_from_slice(&pes[off..off + take]);
            off += take;
            debug_assert_eq!(pkt.len(), TS_PACKET_SIZE, "ts packet framing");
            out.extend_from_slice(&pkt);
            first = false;
        }
    }
}

fn pes_packet(stream_id: u8, pts: u64, dts: u64, data: &Bytes) -> Bytes {
    let with_dts = dts != pts;
    let header_data_len: usize = if with_dts { 10 } else { 5 };
    let mut pes = BytesMut::with_capacity(9 + header_data_len + data.len());
    pes.put_slice(&[0, 0, 1, stream_id]);
    let body_len = 3 + header_data_len + data.len();
    // video PES length 0 is legal for large frames
    pes.put_u16(if body_len > 0xFFFF { 0 } else { body_len as u16 });
    pes.put_u8(0x80);
    pes.put_u8(if with_dts { 0xC0 } else { 0x80 });
    pes.put_u8(header_data_len as u8);
    let mut ts = [0u8; 5];
    encode_pts(&mut ts, if with_dts { 0x3 } else { 0x2 }, pts);
    pes.put_slice(&ts);
    if with_dts {
        encode_pts(&mut ts, 0x1, dts);
        pes.put_slice(&ts);
    }
    pes.extend_from_slice(data);
    pes.freeze()
}

pub(crate) fn encode_pts(out: &mut [u8; 5], prefix: u8, pts: u64) {
    out[0] = (prefix << 4) | (((pts >> 30) as u8 & 0x07) << 1) | 1;
    out[1] = (pts >> 22) as u8;
    out[2] = (((pts >> 15) as u8) << 1) | 1;
    out[3] = (pts >> 7) as u8;
    out[4] = ((pts as u8) << 1) | 1;
}

fn put_pcr(pkt: &mut BytesMut, dts: u64) {
    let base = dts & 0x1_FFFF_FFFF;
    pkt.put_u8((base >> 25) as u8);
    pkt.put_u8((base >> 17) as u8);
    pkt.put_u8((base >> 9) as u8);
    pkt.put_u8((base >> 1) as u8);
    pkt.put_u8(((base as u8 & 1) << 7) | 0x7E);
    pkt.put_u8(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packets_are_aligned() {
        let mut m = TsMuxer::new();
        let video = Bytes::from(vec![0x11u8; 1000]);
        let wire = m.mux_video(0, 0, true, &video);
        assert_eq!(wire.len() % TS_PACKET_SIZE, 0);
        for pkt in wire.chunks(TS_PACKET_SIZE) {
            assert_eq!(pkt[0], 0x47);
        }
    }

    #[test]
    fn test_psi_on_keyframes_only() {
        let mut m = TsMuxer::new();
        let video = Bytes::from(vec![0x11u8; 100]);
        let key = m.mux_video(0, 0, true, &video);
        let inter = m.mux_video(3600, 3600, false, &video);
        // keyframe output: PAT + PMT + payload; inter: payload only
        assert!(key.len() >= inter.len() + 2 * TS_PACKET_SIZE);
    }

    #[test]
    fn test_continuity_counters_increment() {
        let mut m = TsMuxer::new();
        let audio = Bytes::from(vec![0x22u8; 600]);
        let wire = m.mux_audio(0, &audio);
        let ccs: Vec<u8> = wire
            .chunks(TS_PACKET_SIZE)
            .filter(|p| {
                let pid = (u16::from(p[1] & 0x1F) << 8) | u16::from(p[2]);
                pid == PID_AUDIO
            })
            .map(|p| p[3] & 0x0F)
            .collect();
        for w in ccs.windows(2) {
            assert_eq!(w[1], (w[0] + 1) & 0x0F);
        }
    }

    #[test]
    fn test_pes_header_pts_dts() {
        let pes = pes_packet(0xE0, 90000, 86400, &Bytes::from_static(b"x"));
        assert_eq!(&pes[..4], &[0, 0, 1, 0xE0]);
        assert_eq!(pes[7], 0xC0); // PTS+DTS flags
        assert_eq!(crate::demux::decode_pts(&pes[9..14]), 90000);
        assert_eq!(crate::demux::decode_pts(&pes[14..19]), 86400);
    }
}
