//! RTC to RTMP bridge: RTP packets from a WebRTC publisher become FLV
//! tags on the media source.

use crate::bridge::transcode::AudioTranscoder;
use crate::webrtc::track::TrackKind;
use bytes::Bytes;
use flv::{aac, avc};
use hub::{MediaPacket, Source};
use log::debug;
use rtp::payload::H264Depacketizer;
use shared::error::Result;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Consumes the publisher's RTP, reassembles access units, synthesizes the
/// sequence headers from the parameter sets observed on the wire, and
/// pushes FLV-layout packets into the media source.
pub struct RtcToRtmpBridge {
    media_source: Rc<Source>,
    depacketizer: RefCell<H264Depacketizer>,
    access_unit: RefCell<Vec<Bytes>>,
    au_timestamp: Cell<u32>,
    sps: RefCell<Option<Bytes>>,
    pps: RefCell<Option<Bytes>>,
    video_sh: RefCell<Option<Bytes>>,
    video_ts_base: Cell<Option<u32>>,
    audio_ts_base: Cell<Option<u32>>,
    transcoder: Rc<dyn AudioTranscoder>,
    audio_sh_sent: Cell<bool>,
}

impl RtcToRtmpBridge {
    pub fn new(media_source: Rc<Source>, transcoder: Rc<dyn AudioTranscoder>) -> Rc<Self> {
        Rc::new(Self {
            media_source,
            depacketizer: RefCell::new(H264Depacketizer::new()),
            access_unit: RefCell::new(Vec::new()),
            au_timestamp: Cell::new(0),
            sps: RefCell::new(None),
            pps: RefCell::new(None),
            video_sh: RefCell::new(None),
            video_ts_base: Cell::new(None),
            audio_ts_base: Cell::new(None),
            transcoder,
            audio_sh_sent: Cell::new(false),
        })
    }

    pub fn media_source(&self) -> &Rc<Source> {
        &self.media_source
    }

    pub fn on_unpublish(&self) {
        self.access_unit.borrow_mut().clear();
    }

    pub fn on_rtp(&self, packet: &rtp::Packet, kind: TrackKind) -> Result<()> {
        match kind {
            TrackKind::Video => self.on_video_rtp(packet),
            TrackKind::Audio => self.on_audio_rtp(packet),
        }
    }

    fn on_video_rtp(&self, packet: &rtp::Packet) -> Result<()> {
        let ts = packet.header.timestamp;
        // timestamp change mid-AU means we lost the marker; flush anyway
        if !self.access_unit.borrow().is_empty() && self.au_timestamp.get() != ts {
            self.flush_access_unit()?;
        }
        self.au_timestamp.set(ts);

        let nalus = self.depacketizer.borrow_mut().depacketize(&packet.payload)?;
        {
            let mut au = self.access_unit.borrow_mut();
            for nalu in nalus {
                match avc::nalu_type(&nalu) {
                    avc::NALU_TYPE_SPS => *self.sps.borrow_mut() = Some(nalu),
                    avc::NALU_TYPE_PPS => *self.pps.borrow_mut() = Some(nalu),
                    avc::NALU_TYPE_AUD => {}
                    _ => au.push(nalu),
                }
            }
        }
        if packet.header.marker {
            self.flush_access_unit()?;
        }
        Ok(())
    }

    fn flush_access_unit(&self) -> Result<()> {
        let nalus: Vec<Bytes> = self.access_unit.borrow_mut().drain(..).collect();
        let ts = self.au_timestamp.get();
        let base = match self.video_ts_base.get() {
            Some(b) => b,
            None => {
                self.video_ts_base.set(Some(ts));
                ts
            }
        };
        let ms = (ts.wrapping_sub(base) / 90) as i64;
        self.maybe_send_video_sh(ms)?;
        if nalus.is_empty() {
            return Ok(());
        }
        let keyframe = nalus
            .iter()
            .any(|n| avc::nalu_type(n) == avc::NALU_TYPE_IDR);
        let tag = avc::video_nalu_tag(keyframe, 0, &avc::nalus_to_avcc(&nalus));
        self.media_source.on_video(MediaPacket::video(ms, tag))
    }

    fn maybe_send_video_sh(&self, ms: i64) -> Result<()> {
        let (sps, pps) = (self.sps.borrow(), self.pps.borrow());
        let (Some(sps), Some(pps)) = (sps.as_ref(), pps.as_ref()) else {
            return Ok(());
        };
        let record = avc::decoder_configuration_record(sps, pps)?;
        if self.video_sh.borrow().as_ref() == Some(&record) {
            return Ok(());
        }
        debug!("rtc bridge: synthesized avc sequence header");
        *self.video_sh.borrow_mut() = Some(record.clone());
        self.media_source
            .on_video(MediaPacket::video(ms, avc::video_sequence_header_tag(&record)))
    }

    fn on_audio_rtp(&self, packet: &rtp::Packet) -> Result<()> {
        let ts = packet.header.timestamp;
        let base = match self.audio_ts_base.get() {
            Some(b) => b,
            None => {
                self.audio_ts_base.set(Some(ts));
                ts
            }
        };
        // Opus RTP clock is 48 kHz
        let ms = (ts.wrapping_sub(base) / 48) as i64;

        // without a transcoder there is no AAC to announce; drop audio
        // rather than emit frames no decoder could interpret
        let Some(config) = self.transcoder.output_config() else {
            return Ok(());
        };
        let frames = self.transcoder.transcode(&packet.payload)?;
        if frames.is_empty() {
            return Ok(());
        }
        if !self.audio_sh_sent.get() {
            self.audio_sh_sent.set(true);
            self.media_source.on_audio(MediaPacket::audio(
                ms,
                aac::audio_sequence_header_tag(&config.marshal()),
            ))?;
        }
        for frame in frames {
            self.media_source
                .on_audio(MediaPacket::audio(ms, aac::audio_raw_tag(&frame)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transcode::PassthroughTranscoder;
    use hub::Request;
    use rtp::payload::{stap_a, H264Packetizer};

    fn media_source() -> Rc<Source> {
        let req = Request::from_tc_url("rtmp://v/live", "rtc").unwrap();
        let s = Source::new(req, true);
        s.on_publish();
        s
    }

    fn rtp_packet(seq: u16, ts: u32, marker: bool, payload: Bytes) -> rtp::Packet {
        rtp::Packet {
            header: rtp::Header {
                sequence_number: seq,
                timestamp: ts,
                marker,
                payload_type: 102,
                ssrc: 1,
                ..Default::default()
            },
            payload,
        }
    }

    #[test]
    fn test_stap_a_then_idr_builds_sh_and_frame() {
        let source = media_source();
        let c = source.create_consumer(30_000);
        let asc = aac::AudioSpecificConfig {
            object_type: 2,
            sample_rate_index: 4,
            channels: 2,
        };
        let bridge =
            RtcToRtmpBridge::new(source.clone(), PassthroughTranscoder::new(Some(asc)));

        let sps = Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x02, 0x80, 0xF6, 0x40]);
        let pps = Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]);
        let stap = stap_a(&[sps, pps]).unwrap();
        bridge
            .on_rtp(&rtp_packet(1, 9000, false, stap), TrackKind::Video)
            .unwrap();

        // a large IDR fragmented over FU-A, marker on the last
        let idr = {
            let mut v = vec![0x65u8];
            v.extend(std::iter::repeat(7).take(3000));
            Bytes::from(v)
        };
        let packetizer = H264Packetizer::new(1200);
        let frags = packetizer.packetize(&idr);
        let last = frags.len() - 1;
        for (i, frag) in frags.into_iter().enumerate() {
            bridge
                .on_rtp(
                    &rtp_packet(2 + i as u16, 9000, i == last, frag),
                    TrackKind::Video,
                )
                .unwrap();
        }

        let got = c.dump_packets(10);
        assert_eq!(got.len(), 2);
        assert!(got[0].is_sequence_header());
        assert!(got[1].is_video_keyframe());
        // the reassembled AU carries the whole IDR
        let avcc = got[1].payload.slice(5..);
        let nalus = avc::avcc_to_nalus(&avcc).unwrap();
        assert_eq!(nalus, vec![idr]);
    }

    #[test]
    fn test_audio_passthrough_emits_sh_once() {
        let source = media_source();
        let c = source.create_consumer(30_000);
        let asc = aac::AudioSpecificConfig {
            object_type: 2,
            sample_rate_index: 4,
            channels: 2,
        };
        let bridge =
            RtcToRtmpBridge::new(source.clone(), PassthroughTranscoder::new(Some(asc)));

        for i in 0..3u16 {
            bridge
                .on_rtp(
                    &rtp_packet(i, 960 * i as u32, false, Bytes::from_static(&[9, 9])),
                    TrackKind::Audio,
                )
                .unwrap();
        }
        let got = c.dump_packets(10);
        assert_eq!(got.len(), 4); // SH + 3 frames
        assert!(got[0].is_sequence_header());
        assert!(got.iter().skip(1).all(|p| !p.is_sequence_header()));
        // 20ms opus frames at the 48k clock
        assert_eq!(got[2].timestamp, 20);
        assert_eq!(got[3].timestamp, 40);
    }
}
