//! Cross-representation bridges attached to a source during publish.

use crate::packet::MediaPacket;
use shared::error::Result;

/// An in-process adapter that republishes a source in another
/// representation (RTMP to RTC, RTC to RTMP, TS to RTMP).
///
/// Bridges run inside the publishing coroutine's scheduling context: the
/// source calls them synchronously on every packet, after the consumer
/// fan-out. They hold a strong reference to the source they publish INTO;
/// the source holding them only keeps them for the duration of the publish
/// and drops them on unpublish, which breaks the reference cycle.
pub trait Bridge {
    fn on_audio(&self, packet: &MediaPacket) -> Result<()>;
    fn on_video(&self, packet: &MediaPacket) -> Result<()>;
    /// Detach notification; the bridge must drop its downstream resources.
    fn on_unpublish(&self);
}
