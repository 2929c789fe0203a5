//! DVR seam: the segmenter interface and its FLV implementation.
//!
//! Recording attaches to a source like any other consumer; the segmenter
//! owns one output at a time and rolls on keyframes. The MP4 variant is an
//! on-disk format concern and stays out of tree; callers depend only on
//! the trait.

use bytes::BytesMut;
use flv::tag;
use hub::{MediaPacket, PacketKind};
use shared::error::Result;

/// One recording segment sink.
pub trait Segmenter {
    /// Opens a fresh segment; any previous one must have been closed.
    fn open(&mut self) -> Result<()>;

    /// Writes one packet into the current segment.
    fn write_packet(&mut self, packet: &MediaPacket) -> Result<()>;

    /// Closes and returns the finished segment's byte size.
    fn close(&mut self) -> Result<u64>;

    /// Whether a keyframe should roll the segment now.
    fn should_roll(&self, packet: &MediaPacket, written: u64) -> bool;
}

/// Segments as FLV files (here: in-memory buffers the caller persists).
pub struct FlvSegmenter {
    buffer: BytesMut,
    open: bool,
    max_bytes: u64,
    pub finished: Vec<bytes::Bytes>,
}

impl FlvSegmenter {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            buffer: BytesMut::new(),
            open: false,
            max_bytes,
            finished: Vec::new(),
        }
    }
}

impl Segmenter for FlvSegmenter {
    fn open(&mut self) -> Result<()> {
        debug_assert!(!self.open);
        self.buffer.clear();
        self.buffer.extend_from_slice(&tag::flv_header(true, true));
        self.open = true;
        Ok(())
    }

    fn write_packet(&mut self, packet: &MediaPacket) -> Result<()> {
        let tag_type = match packet.kind {
            PacketKind::Audio => tag::TAG_AUDIO,
            PacketKind::Video => tag::TAG_VIDEO,
            PacketKind::Script => tag::TAG_SCRIPT,
        };
        self.buffer.extend_from_slice(&tag::encode_tag(
            tag_type,
            packet.timestamp.max(0) as u32,
            &packet.payload,
        ));
        Ok(())
    }

    fn close(&mut self) -> Result<u64> {
        self.open = false;
        let segment = self.buffer.split().freeze();
        let size = segment.len() as u64;
        self.finished.push(segment);
        Ok(size)
    }

    fn should_roll(&self, packet: &MediaPacket, written: u64) -> bool {
        packet.is_video_keyframe() && written >= self.max_bytes
    }
}
