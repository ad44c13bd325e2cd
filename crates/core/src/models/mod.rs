//! Data models for Convene

mod media;
mod message;
mod room;

pub use media::*;
pub use message::*;
pub use room::*;
