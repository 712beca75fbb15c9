//! Byte transport between the agent and the delta server.
//!
//! # Wire Protocol
//!
//! Length-prefixed frames: `[u32 LE length][u8 type][payload]`
//!
//! See [`framing`] for the codec and [`pipe`] for establishing the channel.

pub mod framing;
pub mod pipe;

pub use framing::{Frame, FrameReader, FrameWriter};
pub use pipe::PipeStream;
