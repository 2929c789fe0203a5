//! Cross-representation bridges: stateful adapters that republish a source
//! in another wire format, running inside the publishing coroutine.

pub mod rtc2rtmp;
pub mod rtmp2rtc;
pub mod transcode;
pub mod ts2rtmp;
