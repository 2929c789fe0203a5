//! Audio transcoding seam.
//!
//! The real implementation wraps an FFmpeg child process (out of scope
//! here); the bridges only depend on this trait. The passthrough double
//! keeps the pipelines testable and lets deployments without a transcoder
//! forward audio frames unchanged.

use bytes::Bytes;
use flv::aac::AudioSpecificConfig;
use shared::error::Result;
use std::rc::Rc;

/// Converts audio frames between the RTC codec (Opus) and the RTMP codec
/// (AAC), in either direction depending on which bridge owns it.
pub trait AudioTranscoder {
    /// Feeds one input frame; zero or more output frames come back (codec
    /// delay means the mapping is not one-to-one).
    fn transcode(&self, frame: &Bytes) -> Result<Vec<Bytes>>;

    /// The AudioSpecificConfig describing AAC output, when producing AAC.
    fn output_config(&self) -> Option<AudioSpecificConfig>;
}

/// Forwards frames unchanged; stands in where no transcoder is deployed.
pub struct PassthroughTranscoder {
    config: Option<AudioSpecificConfig>,
}

impl PassthroughTranscoder {
    pub fn new(config: Option<AudioSpecificConfig>) -> Rc<Self> {
        Rc::new(Self { config })
    }
}

impl AudioTranscoder for PassthroughTranscoder {
    fn transcode(&self, frame: &Bytes) -> Result<Vec<Bytes>> {
        Ok(vec![frame.clone()])
    }

    fn output_config(&self) -> Option<AudioSpecificConfig> {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough() {
        let t = PassthroughTranscoder::new(None);
        let frame = Bytes::from_static(&[1, 2, 3]);
        assert_eq!(t.transcode(&frame).unwrap(), vec![frame]);
        assert!(t.output_config().is_none());
    }
}
