#![warn(rust_2018_idioms)]

pub mod buffer;
pub mod error;
pub mod tcp_framing;
pub mod time;
pub(crate) mod transport;

pub use transport::{
    fast_id_of, FourTuple, TaggedBytesMut, TransportContext, TransportMessage, TransportProtocol,
};
