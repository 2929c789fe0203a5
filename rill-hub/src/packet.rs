//! The unit of exchange inside the hub.

use bytes::Bytes;
use flv::{aac, avc, hevc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Audio,
    Video,
    Script,
}

/// One media message flowing through a [crate::Source].
///
/// The payload is heap-allocated exactly once at network ingress; every
/// consumer queue, the gop cache and the meta cache hold refcounted clones
/// of the same buffer.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub kind: PacketKind,
    /// Milliseconds in the protocol's timebase.
    pub timestamp: i64,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl MediaPacket {
    pub fn audio(timestamp: i64, payload: Bytes) -> Self {
        Self {
            kind: PacketKind::Audio,
            timestamp,
            stream_id: 0,
            payload,
        }
    }

    pub fn video(timestamp: i64, payload: Bytes) -> Self {
        Self {
            kind: PacketKind::Video,
            timestamp,
            stream_id: 0,
            payload,
        }
    }

    pub fn script(timestamp: i64, payload: Bytes) -> Self {
        Self {
            kind: PacketKind::Script,
            timestamp,
            stream_id: 0,
            payload,
        }
    }

    pub fn is_audio(&self) -> bool {
        self.kind == PacketKind::Audio
    }

    pub fn is_video(&self) -> bool {
        self.kind == PacketKind::Video
    }

    pub fn is_script(&self) -> bool {
        self.kind == PacketKind::Script
    }

    /// FLV-layout video keyframe (classic or enhanced layout).
    pub fn is_video_keyframe(&self) -> bool {
        self.is_video() && avc::is_keyframe(&self.payload)
    }

    /// Sequence header of either kind (AVC/HEVC config or AAC config).
    pub fn is_sequence_header(&self) -> bool {
        match self.kind {
            PacketKind::Video => {
                avc::is_avc_sequence_header(&self.payload)
                    || hevc::is_hevc_sequence_header(&self.payload)
            }
            PacketKind::Audio => aac::is_aac_sequence_header(&self.payload),
            PacketKind::Script => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_payload() {
        let p = MediaPacket::video(0, Bytes::from(vec![1u8; 64]));
        let q = p.clone();
        assert_eq!(p.payload.as_ptr(), q.payload.as_ptr());
    }

    #[test]
    fn test_sequence_header_detection() {
        // AVC sequence header: frame 1, codec 7, packet type 0
        let sh = MediaPacket::video(0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0, 1]));
        assert!(sh.is_sequence_header());
        assert!(sh.is_video_keyframe());

        let frame = MediaPacket::video(0, Bytes::from_static(&[0x27, 0x01, 0, 0, 0, 9]));
        assert!(!frame.is_sequence_header());
        assert!(!frame.is_video_keyframe());

        let aac_sh = MediaPacket::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]));
        assert!(aac_sh.is_sequence_header());
        let aac_raw = MediaPacket::audio(0, Bytes::from_static(&[0xAF, 0x01, 0xFF]));
        assert!(!aac_raw.is_sequence_header());
    }
}
