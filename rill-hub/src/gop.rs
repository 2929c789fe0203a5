//! Gop cache: a rolling window of packets starting at the latest keyframe,
//! used to start new consumers on a decodable frame immediately.

use crate::packet::MediaPacket;

/// Beyond this many audio packets with no video, the stream is treated as
/// pure-audio and the cache is cleared to bound memory.
const PURE_AUDIO_GUESS_COUNT: usize = 115;

#[derive(Default)]
pub struct GopCache {
    enabled: bool,
    packets: Vec<MediaPacket>,
    cached_video_count: usize,
    audio_after_last_video: usize,
}

impl GopCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.clear();
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn cache(&mut self, packet: &MediaPacket) {
        if !self.enabled {
            return;
        }
        if packet.is_video() {
            if packet.is_video_keyframe() {
                // a fresh gop starts here
                self.clear();
            } else if self.cached_video_count == 0 {
                // inter frame before any keyframe is undecodable, skip it
                return;
            }
            self.cached_video_count += 1;
            self.audio_after_last_video = 0;
        } else if packet.is_audio() {
            self.audio_after_last_video += 1;
            if self.cached_video_count == 0
                && self.audio_after_last_video > PURE_AUDIO_GUESS_COUNT
            {
                // pure-audio stream: no keyframe will ever come, cap it
                self.clear();
            }
        }
        self.packets.push(packet.clone());
    }

    pub fn clear(&mut self) {
        self.packets.clear();
        self.cached_video_count = 0;
        self.audio_after_last_video = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Chronological dump for a newly attached consumer.
    pub fn packets(&self) -> &[MediaPacket] {
        &self.packets
    }

    /// Whether the head honors the keyframe discipline (always true when a
    /// video frame is cached).
    pub fn starts_at_keyframe(&self) -> bool {
        self.cached_video_count == 0
            || self
                .packets
                .iter()
                .find(|p| p.is_video())
                .map(|p| p.is_video_keyframe())
                .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn keyframe(ts: i64) -> MediaPacket {
        MediaPacket::video(ts, Bytes::from_static(&[0x17, 0x01, 0, 0, 0, 1]))
    }

    fn inter(ts: i64) -> MediaPacket {
        MediaPacket::video(ts, Bytes::from_static(&[0x27, 0x01, 0, 0, 0, 2]))
    }

    fn audio(ts: i64) -> MediaPacket {
        MediaPacket::audio(ts, Bytes::from_static(&[0xAF, 0x01, 3]))
    }

    #[test]
    fn test_disabled_caches_nothing() {
        let mut g = GopCache::new(false);
        g.cache(&keyframe(0));
        assert!(g.is_empty());
    }

    #[test]
    fn test_keyframe_restarts_gop() {
        let mut g = GopCache::new(true);
        g.cache(&keyframe(0));
        g.cache(&audio(10));
        g.cache(&inter(40));
        assert_eq!(g.len(), 3);

        g.cache(&keyframe(80));
        assert_eq!(g.len(), 1);
        assert_eq!(g.packets()[0].timestamp, 80);
        assert!(g.starts_at_keyframe());
    }

    #[test]
    fn test_inter_before_keyframe_dropped() {
        let mut g = GopCache::new(true);
        g.cache(&inter(0));
        g.cache(&inter(40));
        assert!(g.is_empty());

        g.cache(&keyframe(80));
        g.cache(&inter(120));
        assert_eq!(g.len(), 2);
        assert!(g.starts_at_keyframe());
    }

    #[test]
    fn test_pure_audio_capped() {
        let mut g = GopCache::new(true);
        for i in 0..200 {
            g.cache(&audio(i));
        }
        assert!(g.len() <= PURE_AUDIO_GUESS_COUNT + 1);
    }

    #[test]
    fn test_set_disabled_clears() {
        let mut g = GopCache::new(true);
        g.cache(&keyframe(0));
        g.set_enabled(false);
        assert!(g.is_empty());
    }
}
