#![warn(rust_2018_idioms)]

pub mod amf0;
pub mod chunk;
pub mod handshake;
pub mod message;

pub use amf0::Amf0Value;
pub use chunk::{ChunkDecoder, ChunkEncoder};
pub use message::RtmpMessage;
