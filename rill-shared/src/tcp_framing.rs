//! Two-byte big-endian length framing (RFC 4571).
//!
//! Used for ICE over TCP and for the GB28181 PS-over-TCP media channel,
//! which frames each program stream pack the same way:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! -----------------------------------------------------------------
//! |             LENGTH            |  framed packet ...            |
//! -----------------------------------------------------------------
//! ```

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};

/// Length of the framing header (2 bytes for length prefix).
pub const FRAMING_HEADER_LEN: usize = 2;

/// Maximum packet size that can be framed.
pub const MAX_FRAMED_PACKET_SIZE: usize = u16::MAX as usize;

/// Adds the 2-byte length prefix to a packet.
pub fn frame_packet(buf: &[u8]) -> Result<Bytes> {
    if buf.len() > MAX_FRAMED_PACKET_SIZE {
        return Err(Error::FrameTooLarge(buf.len()));
    }
    let mut framed = BytesMut::with_capacity(FRAMING_HEADER_LEN + buf.len());
    framed.extend_from_slice(&(buf.len() as u16).to_be_bytes());
    framed.extend_from_slice(buf);
    Ok(framed.freeze())
}

/// Stateful decoder for framed TCP packets.
///
/// Buffers inbound TCP data and yields complete packets; partial reads of
/// any chunk size are handled.
#[derive(Debug, Default)]
pub struct TcpFrameDecoder {
    buffer: BytesMut,
}

impl TcpFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends data as it arrives from the socket.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete packet without the length header, or `None` if more
    /// data is needed.
    pub fn next_packet(&mut self) -> Option<Bytes> {
        if self.buffer.len() < FRAMING_HEADER_LEN {
            return None;
        }
        let length = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if self.buffer.len() < FRAMING_HEADER_LEN + length {
            return None;
        }
        let _ = self.buffer.split_to(FRAMING_HEADER_LEN);
        Some(self.buffer.split_to(length).freeze())
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_and_decode() {
        let framed = frame_packet(b"Hello").unwrap();
        assert_eq!(&framed[..2], &[0, 5]);

        let mut decoder = TcpFrameDecoder::new();
        decoder.extend_from_slice(&framed);
        assert_eq!(decoder.next_packet().unwrap().as_ref(), b"Hello");
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_decode_partial() {
        let framed = frame_packet(b"Hello").unwrap();
        let mut decoder = TcpFrameDecoder::new();

        decoder.extend_from_slice(&framed[..3]);
        assert!(decoder.next_packet().is_none());

        decoder.extend_from_slice(&framed[3..]);
        assert_eq!(decoder.next_packet().unwrap().as_ref(), b"Hello");
    }

    #[test]
    fn test_decode_back_to_back() {
        let mut decoder = TcpFrameDecoder::new();
        decoder.extend_from_slice(&frame_packet(b"one").unwrap());
        decoder.extend_from_slice(&frame_packet(b"two").unwrap());

        assert_eq!(decoder.next_packet().unwrap().as_ref(), b"one");
        assert_eq!(decoder.next_packet().unwrap().as_ref(), b"two");
        assert!(decoder.next_packet().is_none());
    }

    #[test]
    fn test_empty_packet() {
        let framed = frame_packet(b"").unwrap();
        let mut decoder = TcpFrameDecoder::new();
        decoder.extend_from_slice(&framed);
        assert_eq!(decoder.next_packet().unwrap().len(), 0);
    }

    #[test]
    fn test_oversize_rejected() {
        let huge = vec![0u8; MAX_FRAMED_PACKET_SIZE + 1];
        assert!(matches!(
            frame_packet(&huge),
            Err(Error::FrameTooLarge(_))
        ));
    }
}
