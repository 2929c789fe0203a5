#![warn(rust_2018_idioms)]

pub mod message;

pub use message::{is_stun, Message, MessageType};
