//! Byte cursor and Exp-Golomb bit reader used by the wire codecs.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::{Bytes, BytesMut};

/// Big-endian-first cursor over a borrowed byte slice.
///
/// All codecs in the workspace parse through this reader so short-buffer
/// handling is uniform: every read checks `require` and fails with
/// [Error::BufferShort] instead of panicking on malformed wire input.
pub struct BytesReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BytesReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Current read offset from the start of the slice.
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Fails unless at least `n` bytes are left.
    pub fn require(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(Error::BufferShort {
                requires: n,
                left: self.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.require(1)?;
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.require(2)?;
        let v = BigEndian::read_u16(&self.data[self.pos..]);
        self.pos += 2;
        Ok(v)
    }

    pub fn read_u24(&mut self) -> Result<u32> {
        self.require(3)?;
        let v = BigEndian::read_u24(&self.data[self.pos..]);
        self.pos += 3;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.require(4)?;
        let v = BigEndian::read_u32(&self.data[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.require(8)?;
        let v = BigEndian::read_u64(&self.data[self.pos..]);
        self.pos += 8;
        Ok(v)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.require(8)?;
        let v = BigEndian::read_f64(&self.data[self.pos..]);
        self.pos += 8;
        Ok(v)
    }

    /// Little-endian u32, used by the RTMP extended timestamp on C3 chunks
    /// of some encoders and by SRT control fields.
    pub fn read_u32_le(&mut self) -> Result<u32> {
        self.require(4)?;
        let v = LittleEndian::read_u32(&self.data[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    pub fn read_slice(&mut self, n: usize) -> Result<&'a [u8]> {
        self.require(n)?;
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.read_slice(n)?))
    }

    /// Remaining bytes as an owned buffer; advances to the end.
    pub fn read_remaining(&mut self) -> Bytes {
        let s = Bytes::copy_from_slice(&self.data[self.pos..]);
        self.pos = self.data.len();
        s
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.require(n)?;
        self.pos += n;
        Ok(())
    }

    /// Peek one byte without advancing.
    pub fn peek_u8(&self) -> Result<u8> {
        self.require(1)?;
        Ok(self.data[self.pos])
    }
}

/// Big-endian writer over a `BytesMut`, mirror of [BytesReader].
pub struct BytesWriter {
    buf: BytesMut,
}

impl Default for BytesWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BytesWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.extend_from_slice(&[v]);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u24(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes()[1..]);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_slice(&mut self, s: &[u8]) {
        self.buf.extend_from_slice(s);
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn into_bytes_mut(self) -> BytesMut {
        self.buf
    }
}

/// MSB-first bit reader with the Exp-Golomb decodes needed for H.264/H.265
/// SPS parsing.
pub struct BitReader<'a> {
    data: &'a [u8],
    /// Bit offset from the start of `data`.
    bit: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    pub fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.bit
    }

    pub fn read_bit(&mut self) -> Result<u32> {
        if self.remaining_bits() == 0 {
            return Err(Error::BufferShort {
                requires: 1,
                left: 0,
            });
        }
        let byte = self.data[self.bit / 8];
        let v = (byte >> (7 - (self.bit % 8))) & 1;
        self.bit += 1;
        Ok(v as u32)
    }

    pub fn read_bits(&mut self, n: usize) -> Result<u32> {
        debug_assert!(n <= 32);
        let mut v = 0u32;
        for _ in 0..n {
            v = (v << 1) | self.read_bit()?;
        }
        Ok(v)
    }

    /// ue(v): unsigned Exp-Golomb.
    pub fn read_ue(&mut self) -> Result<u32> {
        let mut zeros = 0usize;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return Err(Error::CodecSanity("exp-golomb run too long".into()));
            }
        }
        let suffix = if zeros == 0 { 0 } else { self.read_bits(zeros)? };
        Ok((1u32 << zeros) - 1 + suffix)
    }

    /// se(v): signed Exp-Golomb.
    pub fn read_se(&mut self) -> Result<i32> {
        let ue = self.read_ue()?;
        let k = ((ue + 1) / 2) as i32;
        Ok(if ue % 2 == 1 { k } else { -k })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_primitives() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let mut r = BytesReader::new(&data);
        assert_eq!(r.read_u8().unwrap(), 0x01);
        assert_eq!(r.read_u16().unwrap(), 0x0203);
        assert_eq!(r.read_u24().unwrap(), 0x040506);
        assert_eq!(r.remaining(), 1);
        assert!(r.read_u16().is_err());
    }

    #[test]
    fn test_reader_le() {
        let data = [0x78, 0x56, 0x34, 0x12];
        let mut r = BytesReader::new(&data);
        assert_eq!(r.read_u32_le().unwrap(), 0x12345678);
    }

    #[test]
    fn test_writer_round_trip() {
        let mut w = BytesWriter::new();
        w.write_u8(0xAB);
        w.write_u24(0x010203);
        w.write_u32(0xDEADBEEF);
        let b = w.freeze();
        let mut r = BytesReader::new(&b);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_u24().unwrap(), 0x010203);
        assert_eq!(r.read_u32().unwrap(), 0xDEADBEEF);
    }

    #[test]
    fn test_exp_golomb() {
        // bitstring: 1 010 011 00100 -> ue values 0, 1, 2, 3
        let data = [0b1_010_011_0, 0b0100_0000];
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_ue().unwrap(), 0);
        assert_eq!(r.read_ue().unwrap(), 1);
        assert_eq!(r.read_ue().unwrap(), 2);
        assert_eq!(r.read_ue().unwrap(), 3);
    }

    #[test]
    fn test_signed_exp_golomb() {
        // ue 1 -> se 1, ue 2 -> se -1
        let data = [0b010_011_00];
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_se().unwrap(), 1);
        assert_eq!(r.read_se().unwrap(), -1);
    }

    #[test]
    fn test_bit_reader_exhaustion() {
        let data = [0xFF];
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_bits(8).unwrap(), 0xFF);
        assert!(r.read_bit().is_err());
    }
}
