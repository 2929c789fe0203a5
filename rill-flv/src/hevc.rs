//! H.265 helpers: the hvcC configuration record and the enhanced-RTMP FLV
//! video tag layout (fourcc `hvc1`).

use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

pub const NALU_TYPE_IDR_W_RADL: u8 = 19;
pub const NALU_TYPE_IDR_N_LP: u8 = 20;
pub const NALU_TYPE_CRA: u8 = 21;
pub const NALU_TYPE_VPS: u8 = 32;
pub const NALU_TYPE_SPS: u8 = 33;
pub const NALU_TYPE_PPS: u8 = 34;

pub fn nalu_type(nalu: &[u8]) -> u8 {
    if nalu.is_empty() {
        0
    } else {
        (nalu[0] >> 1) & 0x3F
    }
}

pub fn is_irap(nalu: &[u8]) -> bool {
    matches!(
        nalu_type(nalu),
        NALU_TYPE_IDR_W_RADL | NALU_TYPE_IDR_N_LP | NALU_TYPE_CRA
    )
}

/// Builds an HEVCDecoderConfigurationRecord from VPS/SPS/PPS.
///
/// The general profile fields are copied out of the SPS profile-tier-level
/// bytes; everything else is fixed for the live-stream case.
pub fn decoder_configuration_record(vps: &Bytes, sps: &Bytes, pps: &Bytes) -> Result<Bytes> {
    if sps.len() < 15 {
        return Err(Error::CodecSanity("hevc sps too short".into()));
    }
    // profile_tier_level starts after nal header (2B) + sps_video_parameter_set_id etc (1B)
    let ptl = &sps[3..];
    let mut w = BytesMut::new();
    w.put_u8(1); // configurationVersion
    w.put_u8(ptl[0]); // general_profile_space/tier/idc
    w.put_slice(&ptl[1..5]); // general_profile_compatibility_flags
    w.put_slice(&ptl[5..11]); // general_constraint_indicator_flags
    w.put_u8(ptl[11]); // general_level_idc
    w.put_u16(0xF000); // min_spatial_segmentation_idc
    w.put_u8(0xFC); // parallelismType
    w.put_u8(0xFD); // chroma_format_idc = 1
    w.put_u8(0xF8); // bit_depth_luma_minus8
    w.put_u8(0xF8); // bit_depth_chroma_minus8
    w.put_u16(0); // avgFrameRate
    w.put_u8(0x0F); // lengthSizeMinusOne = 3, numTemporalLayers 0
    w.put_u8(3); // numOfArrays
    for (nalu_type, nalu) in [(NALU_TYPE_VPS, vps), (NALU_TYPE_SPS, sps), (NALU_TYPE_PPS, pps)]
    {
        w.put_u8(nalu_type); // array_completeness = 0
        w.put_u16(1);
        w.put_u16(nalu.len() as u16);
        w.extend_from_slice(nalu);
    }
    Ok(w.freeze())
}

/// Extracts the parameter-set NALUs from an hvcC record.
pub fn parse_configuration_record(record: &Bytes) -> Result<Vec<Bytes>> {
    if record.len() < 23 || record[0] != 1 {
        return Err(Error::CodecSanity("bad hevc config record".into()));
    }
    let num_arrays = record[22] as usize;
    let mut off = 23;
    let mut out = Vec::new();
    for _ in 0..num_arrays {
        if off + 3 > record.len() {
            return Err(Error::CodecSanity("hevc config truncated".into()));
        }
        let count = u16::from_be_bytes([record[off + 1], record[off + 2]]) as usize;
        off += 3;
        for _ in 0..count {
            if off + 2 > record.len() {
                return Err(Error::CodecSanity("hevc config truncated".into()));
            }
            let len = u16::from_be_bytes([record[off], record[off + 1]]) as usize;
            off += 2;
            if off + len > record.len() {
                return Err(Error::CodecSanity("hevc config truncated".into()));
            }
            out.push(record.slice(off..off + len));
            off += len;
        }
    }
    Ok(out)
}

// Enhanced RTMP (v1) video tag layout: IsExHeader bit + fourcc.

pub const FOURCC_HVC1: &[u8; 4] = b"hvc1";
const EX_HEADER: u8 = 0x80;
const PACKET_TYPE_SEQUENCE_START: u8 = 0;
const PACKET_TYPE_CODED_FRAMES: u8 = 1;
const PACKET_TYPE_CODED_FRAMES_X: u8 = 3;

/// Whether an FLV video payload uses the enhanced (fourcc) layout.
pub fn is_enhanced(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] & EX_HEADER != 0
}

/// Whether an enhanced payload is an hvc1 sequence start.
pub fn is_hevc_sequence_header(payload: &[u8]) -> bool {
    payload.len() >= 5
        && is_enhanced(payload)
        && payload[0] & 0x0F == PACKET_TYPE_SEQUENCE_START
        && &payload[1..5] == FOURCC_HVC1
}

/// `[0x90|frame, "hvc1"] + hvcC`
pub fn video_sequence_header_tag(record: &Bytes) -> Bytes {
    let mut w = BytesMut::with_capacity(5 + record.len());
    w.put_u8(EX_HEADER | (super::avc::FLV_FRAME_KEY << 4) | PACKET_TYPE_SEQUENCE_START);
    w.put_slice(FOURCC_HVC1);
    w.extend_from_slice(record);
    w.freeze()
}

/// Coded frame tag; CodedFramesX drops the composition time offset.
pub fn video_nalu_tag(keyframe: bool, cts: u32, hvcc: &Bytes) -> Bytes {
    let frame = if keyframe {
        super::avc::FLV_FRAME_KEY
    } else {
        super::avc::FLV_FRAME_INTER
    };
    let mut w = BytesMut::with_capacity(8 + hvcc.len());
    if cts == 0 {
        w.put_u8(EX_HEADER | (frame << 4) | PACKET_TYPE_CODED_FRAMES_X);
        w.put_slice(FOURCC_HVC1);
    } else {
        w.put_u8(EX_HEADER | (frame << 4) | PACKET_TYPE_CODED_FRAMES);
        w.put_slice(FOURCC_HVC1);
        w.put_slice(&cts.to_be_bytes()[1..]);
    }
    w.extend_from_slice(hvcc);
    w.freeze()
}
