//! AAC helpers: AudioSpecificConfig, ADTS framing and the FLV audio tag
//! layout (plus the MP3 passthrough case).

use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// FLV SoundFormat values.
pub const SOUND_FORMAT_MP3: u8 = 2;
pub const SOUND_FORMAT_AAC: u8 = 10;

/// Parsed AudioSpecificConfig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sample_rate_index: u8,
    pub channels: u8,
}

impl AudioSpecificConfig {
    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATES
            .get(self.sample_rate_index as usize)
            .copied()
            .unwrap_or(44100)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::CodecSanity("asc too short".into()));
        }
        let object_type = data[0] >> 3;
        let sample_rate_index = ((data[0] & 0x07) << 1) | (data[1] >> 7);
        let channels = (data[1] >> 3) & 0x0F;
        if sample_rate_index as usize >= SAMPLE_RATES.len() {
            return Err(Error::CodecSanity(format!(
                "asc sample rate index {sample_rate_index}"
            )));
        }
        Ok(Self {
            object_type,
            sample_rate_index,
            channels,
        })
    }

    pub fn marshal(&self) -> Bytes {
        let b0 = (self.object_type << 3) | (self.sample_rate_index >> 1);
        let b1 = ((self.sample_rate_index & 1) << 7) | (self.channels << 3);
        Bytes::copy_from_slice(&[b0, b1])
    }
}

/// One ADTS frame header worth of information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    pub config: AudioSpecificConfig,
    pub frame_len: usize,
    pub header_len: usize,
}

/// Parses the ADTS header at the start of `data`.
pub fn parse_adts_header(data: &[u8]) -> Result<AdtsHeader> {
    if data.len() < 7 {
        return Err(Error::CodecSanity("adts too short".into()));
    }
    if data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
        return Err(Error::CodecSanity("adts syncword missing".into()));
    }
    let protection_absent = data[1] & 1 == 1;
    let profile = data[2] >> 6; // object type minus 1
    let sample_rate_index = (data[2] >> 2) & 0x0F;
    let channels = ((data[2] & 1) << 2) | (data[3] >> 6);
    let frame_len = ((data[3] as usize & 0x03) << 11) | (data[4] as usize) << 3
        | (data[5] as usize >> 5);
    let header_len = if protection_absent { 7 } else { 9 };
    if frame_len < header_len {
        return Err(Error::CodecSanity("adts frame length".into()));
    }
    Ok(AdtsHeader {
        config: AudioSpecificConfig {
            object_type: profile + 1,
            sample_rate_index,
            channels,
        },
        frame_len,
        header_len,
    })
}

/// Splits a buffer of back-to-back ADTS frames into raw AAC frames.
pub fn split_adts(data: &Bytes) -> Result<(Option<AudioSpecificConfig>, Vec<Bytes>)> {
    let mut frames = Vec::new();
    let mut config = None;
    let mut off = 0;
    while off + 7 <= data.len() {
        let h = parse_adts_header(&data[off..])?;
        if off + h.frame_len > data.len() {
            break; // partial trailing frame stays unconsumed
        }
        config = Some(h.config);
        frames.push(data.slice(off + h.header_len..off + h.frame_len));
        off += h.frame_len;
    }
    Ok((config, frames))
}

/// Wraps a raw AAC frame in an ADTS header (protection absent).
pub fn adts_frame(config: &AudioSpecificConfig, raw: &[u8]) -> Bytes {
    let frame_len = 7 + raw.len();
    let mut w = BytesMut::with_capacity(frame_len);
    w.put_u8(0xFF);
    w.put_u8(0xF1);
    w.put_u8(
        ((config.object_type - 1) << 6)
            | ((config.sample_rate_index & 0x0F) << 2)
            | (config.channels >> 2),
    );
    w.put_u8(((config.channels & 0x03) << 6) | ((frame_len >> 11) as u8 & 0x03));
    w.put_u8((frame_len >> 3) as u8);
    w.put_u8(((frame_len as u8 & 0x07) << 5) | 0x1F);
    w.put_u8(0xFC);
    w.extend_from_slice(raw);
    w.freeze()
}

// FLV audio tag layout

/// Whether an FLV audio payload is an AAC sequence header.
pub fn is_aac_sequence_header(payload: &[u8]) -> bool {
    payload.len() >= 2 && payload[0] >> 4 == SOUND_FORMAT_AAC && payload[1] == 0
}

pub fn sound_format(payload: &[u8]) -> Option<u8> {
    payload.first().map(|b| b >> 4)
}

/// `[0xAF 0x00] + asc`
pub fn audio_sequence_header_tag(asc: &Bytes) -> Bytes {
    let mut w = BytesMut::with_capacity(2 + asc.len());
    w.put_u8((SOUND_FORMAT_AAC << 4) | 0x0F);
    w.put_u8(0);
    w.extend_from_slice(asc);
    w.freeze()
}

/// `[0xAF 0x01] + raw frame`
pub fn audio_raw_tag(raw: &Bytes) -> Bytes {
    let mut w = BytesMut::with_capacity(2 + raw.len());
    w.put_u8((SOUND_FORMAT_AAC << 4) | 0x0F);
    w.put_u8(1);
    w.extend_from_slice(raw);
    w.freeze()
}
