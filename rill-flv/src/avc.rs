//! H.264 helpers: Annex-B and AVCC NALU handling, the decoder configuration
//! record and the FLV video tag layout.

use bytes::{BufMut, Bytes, BytesMut};
use shared::buffer::BitReader;
use shared::error::{Error, Result};

pub const NALU_TYPE_IDR: u8 = 5;
pub const NALU_TYPE_SEI: u8 = 6;
pub const NALU_TYPE_SPS: u8 = 7;
pub const NALU_TYPE_PPS: u8 = 8;
pub const NALU_TYPE_AUD: u8 = 9;

pub fn nalu_type(nalu: &[u8]) -> u8 {
    if nalu.is_empty() {
        0
    } else {
        nalu[0] & 0x1F
    }
}

/// Splits an Annex-B stream (0x000001 / 0x00000001 delimited) into NALUs.
pub fn annexb_to_nalus(data: &Bytes) -> Vec<Bytes> {
    let mut out = Vec::new();
    let mut i = 0;
    let mut start: Option<usize> = None;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_at = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                out.push(data.slice(s..code_at));
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        if s < data.len() {
            out.push(data.slice(s..));
        }
    }
    out
}

/// Splits 4-byte length-prefixed AVCC data into NALUs.
pub fn avcc_to_nalus(data: &Bytes) -> Result<Vec<Bytes>> {
    let mut out = Vec::new();
    let mut off = 0;
    while off + 4 <= data.len() {
        let len = u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
            as usize;
        off += 4;
        if off + len > data.len() {
            return Err(Error::CodecSanity("avcc length overruns buffer".into()));
        }
        out.push(data.slice(off..off + len));
        off += len;
    }
    Ok(out)
}

/// Joins NALUs into AVCC form.
pub fn nalus_to_avcc(nalus: &[Bytes]) -> Bytes {
    let total: usize = nalus.iter().map(|n| 4 + n.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for n in nalus {
        out.put_u32(n.len() as u32);
        out.extend_from_slice(n);
    }
    out.freeze()
}

/// Builds an AVCDecoderConfigurationRecord from SPS and PPS.
pub fn decoder_configuration_record(sps: &Bytes, pps: &Bytes) -> Result<Bytes> {
    if sps.len() < 4 {
        return Err(Error::CodecSanity("sps too short".into()));
    }
    let mut w = BytesMut::new();
    w.put_u8(1); // configurationVersion
    w.put_u8(sps[1]); // AVCProfileIndication
    w.put_u8(sps[2]); // profile_compatibility
    w.put_u8(sps[3]); // AVCLevelIndication
    w.put_u8(0xFF); // lengthSizeMinusOne = 3
    w.put_u8(0xE1); // one SPS
    w.put_u16(sps.len() as u16);
    w.extend_from_slice(sps);
    w.put_u8(1); // one PPS
    w.put_u16(pps.len() as u16);
    w.extend_from_slice(pps);
    Ok(w.freeze())
}

/// Extracts SPS and PPS lists back out of a configuration record.
pub fn parse_configuration_record(record: &Bytes) -> Result<(Vec<Bytes>, Vec<Bytes>)> {
    if record.len() < 7 || record[0] != 1 {
        return Err(Error::CodecSanity("bad avc config record".into()));
    }
    let mut off = 5;
    let sps_count = (record[off] & 0x1F) as usize;
    off += 1;
    let mut sps = Vec::with_capacity(sps_count);
    for _ in 0..sps_count {
        if off + 2 > record.len() {
            return Err(Error::CodecSanity("avc config truncated".into()));
        }
        let len = u16::from_be_bytes([record[off], record[off + 1]]) as usize;
        off += 2;
        if off + len > record.len() {
            return Err(Error::CodecSanity("avc config truncated".into()));
        }
        sps.push(record.slice(off..off + len));
        off += len;
    }
    if off >= record.len() {
        return Err(Error::CodecSanity("avc config missing pps".into()));
    }
    let pps_count = record[off] as usize;
    off += 1;
    let mut pps = Vec::with_capacity(pps_count);
    for _ in 0..pps_count {
        if off + 2 > record.len() {
            return Err(Error::CodecSanity("avc config truncated".into()));
        }
        let len = u16::from_be_bytes([record[off], record[off + 1]]) as usize;
        off += 2;
        if off + len > record.len() {
            return Err(Error::CodecSanity("avc config truncated".into()));
        }
        pps.push(record.slice(off..off + len));
        off += len;
    }
    Ok((sps, pps))
}

/// Parses picture dimensions out of an SPS.
pub fn sps_dimensions(sps: &Bytes) -> Result<(u32, u32)> {
    if sps.len() < 4 {
        return Err(Error::CodecSanity("sps too short".into()));
    }
    // strip emulation prevention bytes from the RBSP
    let mut rbsp = Vec::with_capacity(sps.len());
    let mut zeros = 0u32;
    for &b in &sps[1..] {
        if zeros == 2 && b == 3 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        rbsp.push(b);
    }

    let mut r = BitReader::new(&rbsp);
    let profile_idc = r.read_bits(8)?;
    let _constraints = r.read_bits(8)?;
    let _level_idc = r.read_bits(8)?;
    let _sps_id = r.read_ue()?;

    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        let chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            r.read_bit()?; // separate_colour_plane_flag
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_bit()?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bit()? == 1 {
            // seq_scaling_matrix_present: skip scaling lists
            let count = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..count {
                if r.read_bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = r.read_ue()?;
    if pic_order_cnt_type == 0 {
        r.read_ue()?;
    } else if pic_order_cnt_type == 1 {
        r.read_bit()?;
        r.read_se()?;
        r.read_se()?;
        let n = r.read_ue()?;
        for _ in 0..n {
            r.read_se()?;
        }
    }
    r.read_ue()?; // max_num_ref_frames
    r.read_bit()?; // gaps_in_frame_num_value_allowed_flag

    let pic_width_in_mbs = r.read_ue()? + 1;
    let pic_height_in_map_units = r.read_ue()? + 1;
    let frame_mbs_only = r.read_bit()?;
    if frame_mbs_only == 0 {
        r.read_bit()?; // mb_adaptive_frame_field_flag
    }
    r.read_bit()?; // direct_8x8_inference_flag

    let mut width = pic_width_in_mbs * 16;
    let mut height = pic_height_in_map_units * 16 * (2 - frame_mbs_only);
    if r.read_bit()? == 1 {
        // frame_cropping
        let left = r.read_ue()?;
        let right = r.read_ue()?;
        let top = r.read_ue()?;
        let bottom = r.read_ue()?;
        width -= (left + right) * 2;
        height -= (top + bottom) * 2;
    }
    Ok((width, height))
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

// FLV video tag layout (classic, codec id 7)

pub const FLV_FRAME_KEY: u8 = 1;
pub const FLV_FRAME_INTER: u8 = 2;
pub const FLV_CODEC_AVC: u8 = 7;

/// Whether an FLV video payload is an AVC sequence header.
pub fn is_avc_sequence_header(payload: &[u8]) -> bool {
    payload.len() >= 2 && payload[0] & 0x0F == FLV_CODEC_AVC && payload[1] == 0
}

/// Whether an FLV video payload starts a keyframe (any codec).
pub fn is_keyframe(payload: &[u8]) -> bool {
    !payload.is_empty() && (payload[0] >> 4) & 0x07 == FLV_FRAME_KEY
}

/// `[0x17 0x00 cts] + record`
pub fn video_sequence_header_tag(record: &Bytes) -> Bytes {
    let mut w = BytesMut::with_capacity(5 + record.len());
    w.put_u8((FLV_FRAME_KEY << 4) | FLV_CODEC_AVC);
    w.put_u8(0);
    w.put_slice(&[0, 0, 0]);
    w.extend_from_slice(record);
    w.freeze()
}

/// `[frame|7 0x01 cts] + avcc`
pub fn video_nalu_tag(keyframe: bool, cts: u32, avcc: &Bytes) -> Bytes {
    let frame = if keyframe {
        FLV_FRAME_KEY
    } else {
        FLV_FRAME_INTER
    };
    let mut w = BytesMut::with_capacity(5 + avcc.len());
    w.put_u8((frame << 4) | FLV_CODEC_AVC);
    w.put_u8(1);
    w.put_slice(&cts.to_be_bytes()[1..]);
    w.extend_from_slice(avcc);
    w.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annexb_split() {
        let data = Bytes::from_static(&[
            0, 0, 0, 1, 0x67, 1, 2, // sps
            0, 0, 1, 0x68, 3, // pps (3-byte code)
            0, 0, 0, 1, 0x65, 9, 9, 9, // idr
        ]);
        let nalus = annexb_to_nalus(&data);
        assert_eq!(nalus.len(), 3);
        assert_eq!(nalu_type(&nalus[0]), NALU_TYPE_SPS);
        assert_eq!(nalu_type(&nalus[1]), NALU_TYPE_PPS);
        assert_eq!(nalu_type(&nalus[2]), NALU_TYPE_IDR);
        assert_eq!(nalus[2].as_ref(), &[0x65, 9, 9, 9]);
    }

    #[test]
    fn test_avcc_round_trip() {
        let nalus = vec![
            Bytes::from_static(&[0x65, 1, 2, 3]),
            Bytes::from_static(&[0x41, 4]),
        ];
        let avcc = nalus_to_avcc(&nalus);
        assert_eq!(avcc_to_nalus(&avcc).unwrap(), nalus);
    }

    #[test]
    fn test_avcc_overrun_fails() {
        let avcc = Bytes::from_static(&[0, 0, 0, 10, 1, 2]);
        assert!(avcc_to_nalus(&avcc).is_err());
    }

    #[test]
    fn test_config_record_round_trip() {
        let sps = Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E, 0xAB]);
        let pps = Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]);
        let record = decoder_configuration_record(&sps, &pps).unwrap();
        let (sps_out, pps_out) = parse_configuration_record(&record).unwrap();
        assert_eq!(sps_out, vec![sps]);
        assert_eq!(pps_out, vec![pps]);
    }

    #[test]
    fn test_sps_dimensions_baseline_640x480() {
        // minimal baseline SPS: poc_type=2, 40x30 macroblocks, no cropping
        let sps = Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x02, 0x80, 0xF6, 0x40]);
        let (w, h) = sps_dimensions(&sps).unwrap();
        assert_eq!((w, h), (640, 480));
    }

    #[test]
    fn test_flv_tag_classification() {
        let sps = Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E]);
        let pps = Bytes::from_static(&[0x68, 0xCE]);
        let record = decoder_configuration_record(&sps, &pps).unwrap();
        let sh = video_sequence_header_tag(&record);
        assert!(is_avc_sequence_header(&sh));
        assert!(is_keyframe(&sh));

        let frame = video_nalu_tag(false, 0, &nalus_to_avcc(&[Bytes::from_static(&[0x41])]));
        assert!(!is_avc_sequence_header(&frame));
        assert!(!is_keyframe(&frame));
    }
}
