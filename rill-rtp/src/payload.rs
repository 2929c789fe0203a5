//! H.264 and H.265 RTP payload formats: STAP-A/FU-A and AP/FU.

use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

pub const H264_NALU_TYPE_STAP_A: u8 = 24;
pub const H264_NALU_TYPE_FU_A: u8 = 28;
pub const H265_NALU_TYPE_AP: u8 = 48;
pub const H265_NALU_TYPE_FU: u8 = 49;

/// Splits one H.264 NALU (no start code) into RTP payloads honoring `mtu`.
///
/// Small NALUs travel as-is; larger ones are FU-A fragmented. Parameter-set
/// aggregation is done by [stap_a] so SPS/PPS ride in one packet ahead of
/// the keyframe.
pub struct H264Packetizer {
    mtu: usize,
}

impl H264Packetizer {
    pub fn new(mtu: usize) -> Self {
        Self { mtu }
    }

    pub fn packetize(&self, nalu: &Bytes) -> Vec<Bytes> {
        if nalu.is_empty() {
            return Vec::new();
        }
        if nalu.len() <= self.mtu {
            return vec![nalu.clone()];
        }

        let indicator = (nalu[0] & 0xE0) | H264_NALU_TYPE_FU_A;
        let nalu_type = nalu[0] & 0x1F;
        let body = &nalu[1..];
        // 2 bytes of FU-A headers per fragment
        let chunk = self.mtu - 2;
        let mut out = Vec::with_capacity(body.len() / chunk + 1);
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + chunk).min(body.len());
            let mut fu_header = nalu_type;
            if offset == 0 {
                fu_header |= 0x80; // S
            }
            if end == body.len() {
                fu_header |= 0x40; // E
            }
            let mut p = BytesMut::with_capacity(2 + end - offset);
            p.put_u8(indicator);
            p.put_u8(fu_header);
            p.extend_from_slice(&body[offset..end]);
            out.push(p.freeze());
            offset = end;
        }
        out
    }
}

/// Aggregates NALUs into one STAP-A payload; `None` if any is empty.
pub fn stap_a(nalus: &[Bytes]) -> Option<Bytes> {
    if nalus.is_empty() || nalus.iter().any(|n| n.is_empty()) {
        return None;
    }
    let total: usize = 1 + nalus.iter().map(|n| 2 + n.len()).sum::<usize>();
    let mut p = BytesMut::with_capacity(total);
    // reuse the highest NRI among the aggregated units
    let nri = nalus.iter().map(|n| n[0] & 0x60).max().unwrap_or(0);
    p.put_u8(nri | H264_NALU_TYPE_STAP_A);
    for n in nalus {
        p.put_u16(n.len() as u16);
        p.extend_from_slice(n);
    }
    Some(p.freeze())
}

/// Reassembles RTP payloads back into H.264 NALUs. FU-A state is kept
/// between calls; a fragment stream broken by loss is discarded at the next
/// start fragment.
#[derive(Default)]
pub struct H264Depacketizer {
    fu_buffer: Option<BytesMut>,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depacketize(&mut self, payload: &Bytes) -> Result<Vec<Bytes>> {
        if payload.is_empty() {
            return Err(Error::RtpPayload("empty h264 payload".into()));
        }
        let nalu_type = payload[0] & 0x1F;
        match nalu_type {
            1..=23 => Ok(vec![payload.clone()]),
            H264_NALU_TYPE_STAP_A => {
                let mut out = Vec::new();
                let mut off = 1;
                while off + 2 <= payload.len() {
                    let len = u16::from_be_bytes([payload[off], payload[off + 1]]) as usize;
                    off += 2;
                    if off + len > payload.len() {
                        return Err(Error::RtpPayload(format!(
                            "stap-a declared {len} bytes with {} left",
                            payload.len() - off
                        )));
                    }
                    out.push(payload.slice(off..off + len));
                    off += len;
                }
                Ok(out)
            }
            H264_NALU_TYPE_FU_A => {
                if payload.len() < 2 {
                    return Err(Error::RtpPayload("fu-a too short".into()));
                }
                let fu_header = payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                if start {
                    let mut buf = BytesMut::new();
                    buf.put_u8((payload[0] & 0xE0) | (fu_header & 0x1F));
                    buf.extend_from_slice(&payload[2..]);
                    self.fu_buffer = Some(buf);
                } else if let Some(buf) = self.fu_buffer.as_mut() {
                    buf.extend_from_slice(&payload[2..]);
                }
                if end {
                    if let Some(buf) = self.fu_buffer.take() {
                        return Ok(vec![buf.freeze()]);
                    }
                }
                Ok(Vec::new())
            }
            t => Err(Error::NaluUnhandled(t)),
        }
    }
}

/// H.265 equivalent of [H264Packetizer]; the two-byte NALU header moves
/// into the FU indicator.
pub struct H265Packetizer {
    mtu: usize,
}

impl H265Packetizer {
    pub fn new(mtu: usize) -> Self {
        Self { mtu }
    }

    pub fn packetize(&self, nalu: &Bytes) -> Vec<Bytes> {
        if nalu.len() < 2 {
            return Vec::new();
        }
        if nalu.len() <= self.mtu {
            return vec![nalu.clone()];
        }

        let nalu_type = (nalu[0] >> 1) & 0x3F;
        let payload_hdr0 = (nalu[0] & 0x81) | (H265_NALU_TYPE_FU << 1);
        let payload_hdr1 = nalu[1];
        let body = &nalu[2..];
        let chunk = self.mtu - 3;
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + chunk).min(body.len());
            let mut fu_header = nalu_type;
            if offset == 0 {
                fu_header |= 0x80;
            }
            if end == body.len() {
                fu_header |= 0x40;
            }
            let mut p = BytesMut::with_capacity(3 + end - offset);
            p.put_u8(payload_hdr0);
            p.put_u8(payload_hdr1);
            p.put_u8(fu_header);
            p.extend_from_slice(&body[offset..end]);
            out.push(p.freeze());
            offset = end;
        }
        out
    }
}

/// Reassembles H.265 RTP payloads (single NALU, AP, FU) into NALUs.
#[derive(Default)]
pub struct H265Depacketizer {
    fu_buffer: Option<BytesMut>,
}

impl H265Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depacketize(&mut self, payload: &Bytes) -> Result<Vec<Bytes>> {
        if payload.len() < 2 {
            return Err(Error::RtpPayload("h265 payload too short".into()));
        }
        let nalu_type = (payload[0] >> 1) & 0x3F;
        match nalu_type {
            H265_NALU_TYPE_AP => {
                let mut out = Vec::new();
                let mut off = 2;
                while off + 2 <= payload.len() {
                    let len = u16::from_be_bytes([payload[off], payload[off + 1]]) as usize;
                    off += 2;
                    if off + len > payload.len() {
                        return Err(Error::RtpPayload("h265 ap truncated".into()));
                    }
                    out.push(payload.slice(off..off + len));
                    off += len;
                }
                Ok(out)
            }
            H265_NALU_TYPE_FU => {
                if payload.len() < 3 {
                    return Err(Error::RtpPayload("h265 fu too short".into()));
                }
                let fu_header = payload[2];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let orig_type = fu_header & 0x3F;
                if start {
                    let mut buf = BytesMut::new();
                    buf.put_u8((payload[0] & 0x81) | (orig_type << 1));
                    buf.put_u8(payload[1]);
                    buf.extend_from_slice(&payload[3..]);
                    self.fu_buffer = Some(buf);
                } else if let Some(buf) = self.fu_buffer.as_mut() {
                    buf.extend_from_slice(&payload[3..]);
                }
                if end {
                    if let Some(buf) = self.fu_buffer.take() {
                        return Ok(vec![buf.freeze()]);
                    }
                }
                Ok(Vec::new())
            }
            0..=47 => Ok(vec![payload.clone()]),
            t => Err(Error::NaluUnhandled(t)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nalu(nalu_type: u8, len: usize) -> Bytes {
        let mut v = vec![0x60 | nalu_type]; // NRI=3
        v.extend((0..len).map(|i| i as u8));
        Bytes::from(v)
    }

    #[test]
    fn test_h264_small_nalu_passthrough() {
        let p = H264Packetizer::new(1200);
        let n = nalu(5, 100);
        assert_eq!(p.packetize(&n), vec![n]);
    }

    #[test]
    fn test_h264_fua_round_trip() {
        let p = H264Packetizer::new(100);
        let n = nalu(5, 1000);
        let frags = p.packetize(&n);
        assert!(frags.len() > 1);
        // S on first, E on last
        assert_eq!(frags[0][1] & 0x80, 0x80);
        assert_eq!(frags.last().unwrap()[1] & 0x40, 0x40);
        for f in &frags {
            assert!(f.len() <= 100);
            assert_eq!(f[0] & 0x1F, H264_NALU_TYPE_FU_A);
        }

        let mut d = H264Depacketizer::new();
        let mut out = Vec::new();
        for f in &frags {
            out.extend(d.depacketize(f).unwrap());
        }
        assert_eq!(out, vec![n]);
    }

    #[test]
    fn test_h264_stap_a_round_trip() {
        let sps = nalu(7, 10);
        let pps = nalu(8, 4);
        let stap = stap_a(&[sps.clone(), pps.clone()]).unwrap();
        assert_eq!(stap[0] & 0x1F, H264_NALU_TYPE_STAP_A);

        let mut d = H264Depacketizer::new();
        assert_eq!(d.depacketize(&stap).unwrap(), vec![sps, pps]);
    }

    #[test]
    fn test_h264_stap_a_truncated_fails() {
        let stap = stap_a(&[nalu(7, 10)]).unwrap();
        let cut = stap.slice(..stap.len() - 2);
        let mut d = H264Depacketizer::new();
        assert!(d.depacketize(&cut).is_err());
    }

    #[test]
    fn test_h264_fua_lost_start_is_dropped() {
        let p = H264Packetizer::new(100);
        let frags = p.packetize(&nalu(1, 500));
        let mut d = H264Depacketizer::new();
        // skip the start fragment
        for f in &frags[1..] {
            let got = d.depacketize(f).unwrap();
            assert!(got.is_empty());
        }
    }

    fn hevc_nalu(nalu_type: u8, len: usize) -> Bytes {
        let mut v = vec![nalu_type << 1, 0x01];
        v.extend((0..len).map(|i| i as u8));
        Bytes::from(v)
    }

    #[test]
    fn test_h265_fu_round_trip() {
        let p = H265Packetizer::new(120);
        let n = hevc_nalu(19, 900); // IDR_W_RADL
        let frags = p.packetize(&n);
        assert!(frags.len() > 1);
        for f in &frags {
            assert_eq!((f[0] >> 1) & 0x3F, H265_NALU_TYPE_FU);
        }

        let mut d = H265Depacketizer::new();
        let mut out = Vec::new();
        for f in &frags {
            out.extend(d.depacketize(f).unwrap());
        }
        assert_eq!(out, vec![n]);
    }

    #[test]
    fn test_h265_ap_parse() {
        let vps = hevc_nalu(32, 6);
        let sps = hevc_nalu(33, 8);
        // build an AP by hand
        let mut ap = BytesMut::new();
        ap.put_u8(H265_NALU_TYPE_AP << 1);
        ap.put_u8(0x01);
        for n in [&vps, &sps] {
            ap.put_u16(n.len() as u16);
            ap.extend_from_slice(n);
        }
        let mut d = H265Depacketizer::new();
        assert_eq!(d.depacketize(&ap.freeze()).unwrap(), vec![vps, sps]);
    }
}
