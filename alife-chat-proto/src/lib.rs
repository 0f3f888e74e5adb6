//! Shared protocol definitions for Additional Life private chat.

pub mod codec;
pub mod destination;
pub mod frame;
pub mod message;
