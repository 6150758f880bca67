//! # Packet Model
//!
//! Direction families, size validation and the decoded packet view.
//!
//! Every decrypted frame starts with a `u32` little-endian packet type whose
//! high bits encode the direction family. Inbound families are the only ones
//! a server dispatch table is populated with; a frame carrying an outbound
//! type (or garbage from a key mismatch) fails the family check and kills
//! the connection.
//!
//! Variable-length packets append a trailer array after their fixed base
//! struct. Both the inbound and outbound validators guard the
//! `base + count * stride` arithmetic against overflow before comparing it
//! to the hard packet ceiling, so a hostile trailer count can never wrap the
//! math into acceptance.

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::{ProtocolError, Result};

/// Hard ceiling on a frame body; the read buffer never grows past this.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Slack below the ceiling reserved for the length prefix and framing
/// margin; all trailer math is validated against this bound.
pub const MAX_PACKET_PAYLOAD: usize = MAX_PACKET_SIZE - 8;

/// Size of the `u32` packet-type tag at the start of every plaintext.
pub const TYPE_TAG_SIZE: usize = 4;

// Direction family masks. The two inbound families address the login and
// shard roles respectively; the outbound families are their mirrors.
pub const CLIENT_TO_LOGIN: u32 = 0x3100_0000;
pub const CLIENT_TO_SHARD: u32 = 0x3200_0000;
pub const LOGIN_TO_CLIENT: u32 = 0x2100_0000;
pub const SHARD_TO_CLIENT: u32 = 0x2200_0000;

/// True when `ptype` belongs to one of the client-to-server families.
pub const fn is_inbound(ptype: u32) -> bool {
    (ptype & CLIENT_TO_LOGIN) == CLIENT_TO_LOGIN || (ptype & CLIENT_TO_SHARD) == CLIENT_TO_SHARD
}

/// True when `ptype` belongs to one of the server-to-client families.
pub const fn is_outbound(ptype: u32) -> bool {
    (ptype & LOGIN_TO_CLIENT) == LOGIN_TO_CLIENT || (ptype & SHARD_TO_CLIENT) == SHARD_TO_CLIENT
}

/// Overflow-safe validation of an outbound variable-length packet: does
/// `base + count * stride` fit under the packet ceiling?
pub const fn valid_out_var(base: usize, count: i32, stride: usize) -> bool {
    if count < 0 {
        return false;
    }

    // multiplication overflow guard
    if count > 0 && MAX_PACKET_PAYLOAD / (count as usize) < stride {
        return false;
    }

    // safe to multiply
    let trailing = count as usize * stride;

    // the sum gets the same care as the product
    match base.checked_add(trailing) {
        Some(total) => total <= MAX_PACKET_PAYLOAD,
        None => false,
    }
}

/// Overflow-safe validation of an inbound variable-length packet: the
/// outbound bound must hold and the payload size must match exactly.
pub const fn valid_in_var(base: usize, count: i32, stride: usize, payload_size: usize) -> bool {
    if !valid_out_var(base, count, stride) {
        return false;
    }

    payload_size == base + count as usize * stride
}

/// A decoded inbound packet: the decrypted frame plus the wire geometry
/// resolved from the dispatch table. Valid only for the duration of the
/// handler call; handlers that need to retain data must decode or copy it.
#[derive(Debug, Clone)]
pub struct PacketData {
    ptype: u32,
    /// Full decrypted frame, type tag included.
    buf: Bytes,
    base: usize,
    trailer_count: usize,
    stride: usize,
}

impl PacketData {
    pub(crate) fn new(ptype: u32, buf: Bytes, base: usize, trailer_count: usize, stride: usize) -> Self {
        debug_assert!(buf.len() >= TYPE_TAG_SIZE + base + trailer_count * stride);
        Self {
            ptype,
            buf,
            base,
            trailer_count,
            stride,
        }
    }

    /// The packet type tag.
    pub fn ptype(&self) -> u32 {
        self.ptype
    }

    /// Everything after the type tag: base struct plus trailers.
    pub fn payload(&self) -> &[u8] {
        &self.buf[TYPE_TAG_SIZE..]
    }

    /// The fixed base struct region.
    pub fn body(&self) -> &[u8] {
        &self.payload()[..self.base]
    }

    /// Number of trailer records carried after the base struct.
    pub fn trailer_count(&self) -> usize {
        self.trailer_count
    }

    /// The raw trailer region.
    pub fn trailers(&self) -> &[u8] {
        &self.payload()[self.base..]
    }

    /// The `i`-th trailer record, or `None` past the end.
    pub fn trailer(&self, i: usize) -> Option<&[u8]> {
        if i >= self.trailer_count {
            return None;
        }
        let start = self.base + i * self.stride;
        Some(&self.payload()[start..start + self.stride])
    }

    /// Decode the base struct.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(self.body())
            .map_err(|e| ProtocolError::DeserializeError(e.to_string()))
    }

    /// Decode the `i`-th trailer record.
    pub fn decode_trailer<T: DeserializeOwned>(&self, i: usize) -> Result<T> {
        let raw = self
            .trailer(i)
            .ok_or_else(|| ProtocolError::DeserializeError(format!("no trailer {i}")))?;
        bincode::deserialize(raw).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
    }

    /// Decode every trailer record into a vector.
    pub fn decode_trailers<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        (0..self.trailer_count).map(|i| self.decode_trailer(i)).collect()
    }
}
