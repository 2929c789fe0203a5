#![warn(rust_2018_idioms)]

pub mod cond;
pub mod coroutine;
pub mod hourglass;
pub mod pithy;
pub mod resource;

pub use cond::CondWaiter;
pub use coroutine::{generate_cid, Coroutine, CoroutineContext};
pub use resource::{Resource, ResourceManager};
