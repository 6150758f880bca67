//! # Error Types
//!
//! Comprehensive error handling for the connection runtime.
//!
//! This module defines all error variants that can occur while framing,
//! ciphering and dispatching packets, from low-level I/O errors to protocol
//! violations raised by hostile or malformed peers.
//!
//! ## Error Categories
//! - **I/O Errors**: socket failures other than would-block
//! - **Protocol Errors**: bad frame lengths, wrong direction family,
//!   trailer-math mismatches
//! - **Codec Errors**: packet struct (de)serialization failures
//! - **Configuration Errors**: invalid or unreadable settings
//!
//! The framing layer never retries: a protocol violation or I/O error kills
//! the offending connection, while would-block simply pauses the read or
//! write until the next readiness event.

use std::io;
use thiserror::Error;

/// ProtocolError is the primary error type for all runtime operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Bad frame length: {0}")]
    BadFrameLength(u32),

    #[error("Packet type {0:#010x} is not in the expected direction family")]
    BadDirection(u32),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error(
        "Trailer validation failed for type {ptype:#010x}: \
         base {base} + {count} x {stride} != payload {size}"
    )]
    TrailerMismatch {
        ptype: u32,
        base: usize,
        count: i32,
        stride: usize,
        size: usize,
    },

    #[error("Unknown packet type: {0:#010x}")]
    UnknownPacket(u32),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// True when the underlying I/O would block; the reactor retries these
    /// on the next readiness event instead of killing the connection.
    pub fn is_would_block(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
