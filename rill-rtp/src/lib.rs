#![warn(rust_2018_idioms)]

pub mod header;
pub mod jitter;
pub mod nack;
pub mod packet;
pub mod payload;
pub mod ring;
pub mod rtcp;
pub mod sequence;
pub mod twcc;

pub use header::{Extension, Header};
pub use packet::Packet;
