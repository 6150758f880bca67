//! # Core Protocol
//!
//! The wire-level building blocks: the XOR/byte-swap cipher, the
//! length-prefixed frame codec, and the packet model with its direction
//! families and overflow-safe trailer validation.

pub mod cipher;
pub mod codec;
pub mod packet;

pub use codec::FrameReader;
pub use packet::{PacketData, MAX_PACKET_SIZE};
