//! Metadata and sequence header cache, dumped to every new consumer ahead
//! of the gop cache.

use crate::packet::MediaPacket;

#[derive(Default)]
pub struct MetaCache {
    metadata: Option<MediaPacket>,
    video_sh: Option<MediaPacket>,
    audio_sh: Option<MediaPacket>,
}

impl MetaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_metadata(&mut self, packet: MediaPacket) {
        self.metadata = Some(packet);
    }

    /// A new sequence header of the same kind overwrites the previous one.
    pub fn update_sequence_header(&mut self, packet: MediaPacket) {
        if packet.is_video() {
            self.video_sh = Some(packet);
        } else if packet.is_audio() {
            self.audio_sh = Some(packet);
        }
    }

    pub fn metadata(&self) -> Option<&MediaPacket> {
        self.metadata.as_ref()
    }

    pub fn video_sh(&self) -> Option<&MediaPacket> {
        self.video_sh.as_ref()
    }

    pub fn audio_sh(&self) -> Option<&MediaPacket> {
        self.audio_sh.as_ref()
    }

    /// Serving order for a new consumer: metadata, audio SH, video SH.
    pub fn dump(&self) -> Vec<MediaPacket> {
        [&self.metadata, &self.audio_sh, &self.video_sh]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.metadata = None;
        self.video_sh = None;
        self.audio_sh = None;
    }
}
