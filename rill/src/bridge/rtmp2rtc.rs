//! RTMP to RTC bridge: FLV tags from the media source become RTP packets
//! on the RTC source.
//!
//! Attached as a hub bridge during publish, so it runs inside the
//! publishing coroutine right after the consumer fan-out.

use crate::bridge::transcode::AudioTranscoder;
use bytes::Bytes;
use flv::{aac, avc};
use hub::{Bridge, MediaPacket, Source};
use log::debug;
use rtp::payload::{stap_a, H264Packetizer};
use shared::error::Result;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

pub const RTC_AUDIO_PT: u8 = 111;
pub const RTC_VIDEO_PT: u8 = 102;
const RTP_MTU: usize = 1200;

/// FLV in, marshaled RTP out. The RTC source's packets carry the marshaled
/// datagram as payload; play sessions rewrite seq/ssrc per subscriber.
pub struct RtmpToRtcBridge {
    rtc_source: Rc<Source>,
    packetizer: H264Packetizer,
    sps: RefCell<Vec<Bytes>>,
    pps: RefCell<Vec<Bytes>>,
    video_seq: Cell<u16>,
    audio_seq: Cell<u16>,
    transcoder: Rc<dyn AudioTranscoder>,
}

impl RtmpToRtcBridge {
    pub fn new(rtc_source: Rc<Source>, transcoder: Rc<dyn AudioTranscoder>) -> Rc<Self> {
        Rc::new(Self {
            rtc_source,
            packetizer: H264Packetizer::new(RTP_MTU),
            sps: RefCell::new(Vec::new()),
            pps: RefCell::new(Vec::new()),
            video_seq: Cell::new(0),
            audio_seq: Cell::new(0),
            transcoder,
        })
    }

    pub fn rtc_source(&self) -> &Rc<Source> {
        &self.rtc_source
    }

    fn next_video_seq(&self) -> u16 {
        let s = self.video_seq.get();
        self.video_seq.set(s.wrapping_add(1));
        s
    }

    fn next_audio_seq(&self) -> u16 {
        let s = self.audio_seq.get();
        self.audio_seq.set(s.wrapping_add(1));
        s
    }

    fn push_video(&self, ts_90k: u32, marker: bool, payload: Bytes) -> Result<()> {
        let packet = rtp::Packet {
            header: rtp::Header {
                marker,
                payload_type: RTC_VIDEO_PT,
                sequence_number: self.next_video_seq(),
                timestamp: ts_90k,
                ssrc: 0, // rewritten per subscriber track
                ..Default::default()
            },
            payload,
        };
        self.rtc_source.on_video(MediaPacket::video(
            ts_90k as i64,
            packet.marshal(),
        ))
    }
}

impl Bridge for RtmpToRtcBridge {
    /// AAC frames transcode to Opus and ride 20 ms RTP packets on the
    /// audio sample clock.
    fn on_audio(&self, pkt: &MediaPacket) -> Result<()> {
        if aac::is_aac_sequence_header(&pkt.payload) || pkt.payload.len() <= 2 {
            return Ok(());
        }
        let raw = pkt.payload.slice(2..);
        let ts_48k = (pkt.timestamp.max(0) as u32).wrapping_mul(48);
        for frame in self.transcoder.transcode(&raw)? {
            let packet = rtp::Packet {
                header: rtp::Header {
                    payload_type: RTC_AUDIO_PT,
                    sequence_number: self.next_audio_seq(),
                    timestamp: ts_48k,
                    ssrc: 0,
                    ..Default::default()
                },
                payload: frame,
            };
            self.rtc_source.on_audio(MediaPacket::audio(
                ts_48k as i64,
                packet.marshal(),
            ))?;
        }
        Ok(())
    }

    /// Video tags split into NALUs; parameter sets aggregate into a STAP-A
    /// riding ahead of each keyframe, large NALUs fragment into FU-A.
    fn on_video(&self, pkt: &MediaPacket) -> Result<()> {
        if pkt.payload.len() < 5 {
            return Ok(());
        }
        if flv::hevc::is_enhanced(&pkt.payload) {
            debug!("rtc bridge: hevc is not packetized, dropping");
            return Ok(());
        }
        let ts_90k = (pkt.timestamp.max(0) as u32).wrapping_mul(90);

        if avc::is_avc_sequence_header(&pkt.payload) {
            let record = pkt.payload.slice(5..);
            let (sps, pps) = avc::parse_configuration_record(&record)?;
            *self.sps.borrow_mut() = sps;
            *self.pps.borrow_mut() = pps;
            return Ok(());
        }

        let keyframe = avc::is_keyframe(&pkt.payload);
        let nalus = avc::avcc_to_nalus(&pkt.payload.slice(5..))?;
        if nalus.is_empty() {
            return Ok(());
        }

        if keyframe {
            let params: Vec<Bytes> = self
                .sps
                .borrow()
                .iter()
                .chain(self.pps.borrow().iter())
                .cloned()
                .collect();
            if let Some(stap) = stap_a(&params) {
                self.push_video(ts_90k, false, stap)?;
            }
        }

        let last_nalu = nalus.len() - 1;
        for (i, nalu) in nalus.iter().enumerate() {
            let frags = self.packetizer.packetize(nalu);
            let last_frag = frags.len().saturating_sub(1);
            for (j, frag) in frags.into_iter().enumerate() {
                let marker = i == last_nalu && j == last_frag;
                self.push_video(ts_90k, marker, frag)?;
            }
        }
        Ok(())
    }

    fn on_unpublish(&self) {
        self.sps.borrow_mut().clear();
        self.pps.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transcode::PassthroughTranscoder;
    use hub::{JitterAlgorithm, Request};

    fn rtc_source() -> Rc<Source> {
        let req = Request::from_tc_url("rtmp://v/live", "s").unwrap();
        let s = Source::new(req, false);
        s.set_jitter_algorithm(JitterAlgorithm::Off);
        s.on_publish();
        s
    }

    fn sh_tag() -> MediaPacket {
        let sps = Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x02, 0x80, 0xF6, 0x40]);
        let pps = Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]);
        let record = avc::decoder_configuration_record(&sps, &pps).unwrap();
        MediaPacket::video(0, avc::video_sequence_header_tag(&record))
    }

    fn keyframe_tag(ts: i64, nalu_len: usize) -> MediaPacket {
        let mut idr = vec![0x65u8];
        idr.extend(std::iter::repeat(3).take(nalu_len));
        let avcc = avc::nalus_to_avcc(&[Bytes::from(idr)]);
        MediaPacket::video(ts, avc::video_nalu_tag(true, 0, &avcc))
    }

    #[test]
    fn test_keyframe_gets_stap_a_and_fua() {
        let source = rtc_source();
        let c = source.create_consumer(0);
        let bridge = RtmpToRtcBridge::new(source.clone(), PassthroughTranscoder::new(None));

        bridge.on_video(&sh_tag()).unwrap();
        bridge.on_video(&keyframe_tag(40, 3000)).unwrap();

        let got = c.dump_packets(100);
        assert!(got.len() >= 4); // STAP-A + 3 FU-A fragments

        let first = rtp::Packet::unmarshal(&got[0].payload).unwrap();
        assert_eq!(
            first.payload[0] & 0x1F,
            rtp::payload::H264_NALU_TYPE_STAP_A
        );
        assert!(!first.header.marker);
        assert_eq!(first.header.timestamp, 40 * 90);

        let last = rtp::Packet::unmarshal(&got.last().unwrap().payload).unwrap();
        assert!(last.header.marker);

        // sequence numbers are consecutive
        let seqs: Vec<u16> = got
            .iter()
            .map(|p| {
                rtp::Packet::unmarshal(&p.payload)
                    .unwrap()
                    .header
                    .sequence_number
            })
            .collect();
        for w in seqs.windows(2) {
            assert_eq!(w[1], w[0].wrapping_add(1));
        }
    }

    #[test]
    fn test_audio_packets_on_sample_clock() {
        let source = rtc_source();
        let c = source.create_consumer(0);
        let bridge = RtmpToRtcBridge::new(source.clone(), PassthroughTranscoder::new(None));

        let tag = MediaPacket::audio(20, aac::audio_raw_tag(&Bytes::from_static(&[7, 7])));
        bridge.on_audio(&tag).unwrap();

        let got = c.dump_packets(10);
        assert_eq!(got.len(), 1);
        let pkt = rtp::Packet::unmarshal(&got[0].payload).unwrap();
        assert_eq!(pkt.header.timestamp, 20 * 48);
        assert_eq!(pkt.header.payload_type, RTC_AUDIO_PT);
    }

    #[test]
    fn test_sequence_header_not_forwarded() {
        let source = rtc_source();
        let c = source.create_consumer(0);
        let bridge = RtmpToRtcBridge::new(source.clone(), PassthroughTranscoder::new(None));
        bridge.on_video(&sh_tag()).unwrap();
        assert!(c.dump_packets(10).is_empty());
    }
}
