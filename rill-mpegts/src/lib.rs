#![warn(rust_2018_idioms)]

pub mod demux;
pub mod mux;
pub mod ps;

pub use demux::{AudioCodec, EsFrame, TsDemuxer, VideoCodec};
pub use mux::TsMuxer;

/// Transport stream packet size.
pub const TS_PACKET_SIZE: usize = 188;
