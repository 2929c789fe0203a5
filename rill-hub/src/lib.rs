#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod consumer;
pub mod gop;
pub mod jitter;
pub mod meta;
pub mod packet;
pub mod request;
pub mod source;
pub mod token;

pub use bridge::Bridge;
pub use consumer::Consumer;
pub use jitter::JitterAlgorithm;
pub use packet::{MediaPacket, PacketKind};
pub use request::Request;
pub use source::{Source, SourceManager};
