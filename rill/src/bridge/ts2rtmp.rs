//! Frame builder shared by the SRT and GB28181 ingest paths: elementary
//! stream frames in, RTMP-layout packets into a source.

use bytes::Bytes;
use flv::aac::{self, AudioSpecificConfig};
use flv::{avc, hevc};
use hub::{MediaPacket, Source};
use log::debug;
use mpegts::{AudioCodec, EsFrame, VideoCodec};
use shared::error::Result;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Assembles FLV-layout audio/video from demuxed TS/PS frames, emitting
/// synthetic sequence headers whenever the parameter sets change.
pub struct FrameBuilder {
    source: Rc<Source>,
    sps: RefCell<Option<Bytes>>,
    pps: RefCell<Option<Bytes>>,
    vps: RefCell<Option<Bytes>>,
    video_sh: RefCell<Option<Bytes>>,
    asc: Cell<Option<AudioSpecificConfig>>,
}

impl FrameBuilder {
    pub fn new(source: Rc<Source>) -> Rc<Self> {
        Rc::new(Self {
            source,
            sps: RefCell::new(None),
            pps: RefCell::new(None),
            vps: RefCell::new(None),
            video_sh: RefCell::new(None),
            asc: Cell::new(None),
        })
    }

    pub fn source(&self) -> &Rc<Source> {
        &self.source
    }

    pub fn on_frame(&self, frame: &EsFrame) -> Result<()> {
        match frame {
            EsFrame::Video {
                codec,
                pts,
                dts,
                data,
            } => match codec {
                VideoCodec::H264 => self.on_h264(*pts, *dts, data),
                VideoCodec::Hevc => self.on_hevc(*pts, *dts, data),
            },
            EsFrame::Audio { codec, pts, data } => match codec {
                AudioCodec::AacAdts => self.on_aac(*pts, data),
                AudioCodec::Mp3 => self.on_mp3(*pts, data),
            },
        }
    }

    fn on_h264(&self, pts: u64, dts: u64, data: &Bytes) -> Result<()> {
        let mut frame_nalus = Vec::new();
        let mut keyframe = false;
        for nalu in avc::annexb_to_nalus(data) {
            match avc::nalu_type(&nalu) {
                avc::NALU_TYPE_SPS => *self.sps.borrow_mut() = Some(nalu),
                avc::NALU_TYPE_PPS => *self.pps.borrow_mut() = Some(nalu),
                avc::NALU_TYPE_AUD => {}
                t => {
                    if t == avc::NALU_TYPE_IDR {
                        keyframe = true;
                    }
                    frame_nalus.push(nalu);
                }
            }
        }

        let dts_ms = (dts / 90) as i64;
        self.maybe_send_avc_sh(dts_ms)?;
        if frame_nalus.is_empty() {
            return Ok(());
        }
        let cts = (pts.saturating_sub(dts) / 90) as u32;
        let tag = avc::video_nalu_tag(keyframe, cts, &avc::nalus_to_avcc(&frame_nalus));
        self.source.on_video(MediaPacket::video(dts_ms, tag))
    }

    fn maybe_send_avc_sh(&self, dts_ms: i64) -> Result<()> {
        let (sps, pps) = (self.sps.borrow(), self.pps.borrow());
        let (Some(sps), Some(pps)) = (sps.as_ref(), pps.as_ref()) else {
            return Ok(());
        };
        let record = avc::decoder_configuration_record(sps, pps)?;
        if self.video_sh.borrow().as_ref() == Some(&record) {
            return Ok(());
        }
        debug!("frame builder: new avc sequence header");
        *self.video_sh.borrow_mut() = Some(record.clone());
        self.source.on_video(MediaPacket::video(
            dts_ms,
            avc::video_sequence_header_tag(&record),
        ))
    }

    fn on_hevc(&self, pts: u64, dts: u64, data: &Bytes) -> Result<()> {
        let mut frame_nalus = Vec::new();
        let mut keyframe = false;
        for nalu in avc::annexb_to_nalus(data) {
            match hevc::nalu_type(&nalu) {
                hevc::NALU_TYPE_VPS => *self.vps.borrow_mut() = Some(nalu),
                hevc::NALU_TYPE_SPS => *self.sps.borrow_mut() = Some(nalu),
                hevc::NALU_TYPE_PPS => *self.pps.borrow_mut() = Some(nalu),
                _ => {
                    if hevc::is_irap(&nalu) {
                        keyframe = true;
                    }
                    frame_nalus.push(nalu);
                }
            }
        }

        let dts_ms = (dts / 90) as i64;
        self.maybe_send_hevc_sh(dts_ms)?;
        if frame_nalus.is_empty() {
            return Ok(());
        }
        let cts = (pts.saturating_sub(dts) / 90) as u32;
        let tag = hevc::video_nalu_tag(keyframe, cts, &avc::nalus_to_avcc(&frame_nalus));
        self.source.on_video(MediaPacket::video(dts_ms, tag))
    }

    fn maybe_send_hevc_sh(&self, dts_ms: i64) -> Result<()> {
        let (vps, sps, pps) = (
            self.vps.borrow(),
            self.sps.borrow(),
            self.pps.borrow(),
        );
        let (Some(vps), Some(sps), Some(pps)) = (vps.as_ref(), sps.as_ref(), pps.as_ref())
        else {
            return Ok(());
        };
        let record = hevc::decoder_configuration_record(vps, sps, pps)?;
        if self.video_sh.borrow().as_ref() == Some(&record) {
            return Ok(());
        }
        debug!("frame builder: new hevc sequence header");
        *self.video_sh.borrow_mut() = Some(record.clone());
        self.source.on_video(MediaPacket::video(
            dts_ms,
            hevc::video_sequence_header_tag(&record),
        ))
    }

    fn on_aac(&self, pts: u64, data: &Bytes) -> Result<()> {
        let (config, frames) = aac::split_adts(data)?;
        let pts_ms = (pts / 90) as i64;
        if let Some(config) = config {
            if self.asc.get() != Some(config) {
                self.asc.set(Some(config));
                self.source.on_audio(MediaPacket::audio(
                    pts_ms,
                    aac::audio_sequence_header_tag(&config.marshal()),
                ))?;
            }
        }
        for raw in frames {
            self.source
                .on_audio(MediaPacket::audio(pts_ms, aac::audio_raw_tag(&raw)))?;
        }
        Ok(())
    }

    fn on_mp3(&self, pts: u64, data: &Bytes) -> Result<()> {
        let mut payload = Vec::with_capacity(1 + data.len());
        // sound format 2 (MP3), 44kHz stereo 16-bit flags
        payload.push((aac::SOUND_FORMAT_MP3 << 4) | 0x0F);
        payload.extend_from_slice(data);
        self.source
            .on_audio(MediaPacket::audio((pts / 90) as i64, Bytes::from(payload)))
    }
}
