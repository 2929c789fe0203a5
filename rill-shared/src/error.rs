use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Workspace-wide error type.
///
/// Every crate in the workspace returns this enum; wrapping a lower layer
/// adds one variant of context. Terminal errors close the owning coroutine,
/// non-terminal ones are logged and dropped at the call site.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    // io & scheduling
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("socket timeout")]
    SocketTimeout,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("coroutine interrupted")]
    CoroutineInterrupted,
    #[error("resource limit: {0}")]
    ResourceLimit(String),

    // buffers & framing
    #[error("buffer short: requires {requires} bytes, {left} left")]
    BufferShort { requires: usize, left: usize },
    #[error("frame of {0} bytes exceeds the 2-byte length prefix")]
    FrameTooLarge(usize),

    // rtmp
    #[error("rtmp handshake: {0}")]
    HandshakeFailed(String),
    #[error("rtmp chunk: {0}")]
    ChunkDecode(String),
    #[error("amf0: {0}")]
    Amf0Decode(String),
    #[error("rtmp command: {0}")]
    RtmpCommand(String),
    #[error("stream {0} is already publishing")]
    StreamBusy(String),

    // rtp & rtcp
    #[error("rtp header too short")]
    RtpHeaderShort,
    #[error("rtp payload: {0}")]
    RtpPayload(String),
    #[error("rtcp: {0}")]
    RtcpDecode(String),
    #[error("nalu type {0} is not handled")]
    NaluUnhandled(u8),

    // stun
    #[error("stun: {0}")]
    StunDecode(String),
    #[error("stun integrity check failed")]
    StunIntegrityMismatch,
    #[error("stun fingerprint check failed")]
    StunFingerprintMismatch,
    #[error("stun attribute {0:#06x} not found")]
    StunAttributeNotFound(u16),

    // srtp & dtls
    #[error("srtp auth tag verify failed")]
    SrtpAuthFailed,
    #[error("srtp replayed packet ssrc={ssrc} index={index}")]
    SrtpReplayed { ssrc: u32, index: u64 },
    #[error("srtp packet of {0} bytes too short")]
    SrtpShortPacket(usize),
    #[error("srtp master key must be {expect} bytes, got {got}")]
    SrtpKeyLength { expect: usize, got: usize },
    #[error("dtls: {0}")]
    Dtls(String),
    #[error("dtls handshake timeout")]
    DtlsTimeout,

    // mpeg ts / ps
    #[error("ts: {0}")]
    TsDecode(String),
    #[error("ps: {0}")]
    PsDecode(String),

    // flv & codecs
    #[error("flv: {0}")]
    FlvDecode(String),
    #[error("codec: {0}")]
    CodecSanity(String),

    // http
    #[error("http parse: {0}")]
    HttpParse(String),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("hook {action} denied with status {status}")]
    HookDenied { action: String, status: u16 },

    // srt
    #[error("srt: {0}")]
    SrtDecode(String),
    #[error("srt handshake: {0}")]
    SrtHandshake(String),
    #[error("srt streamid invalid: {0}")]
    SrtStreamId(String),

    // config & control plane
    #[error("config: {0}")]
    ConfigInvalid(String),
    #[error("sdp: {0}")]
    SdpDecode(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Whether the error is a benign timeout that hot read loops retry on.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::SocketTimeout)
    }

    /// Whether the error came from a stop/interrupt request on the owning
    /// coroutine rather than from the peer or the wire.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Error::CoroutineInterrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(Error::SocketTimeout.is_timeout());
        assert!(!Error::ConnectionClosed.is_timeout());
        assert!(Error::CoroutineInterrupted.is_interrupt());
    }

    #[test]
    fn test_io_error_wraps() {
        let e: Error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(e, Error::Io(_)));
    }
}
