//! # Dispatch Table
//!
//! Mapping from packet type to handler plus the wire geometry needed to
//! validate a frame before its handler ever sees it.
//!
//! A table is built once per server role at startup and is immutable
//! afterwards; the reactor reads it on every inbound frame. Only inbound
//! packet types may be registered. For variable-length packets the table
//! records where the trailer count lives inside the base struct and how
//! wide one trailer record is, so the parser can enforce
//! `base + count * stride == payload` with the overflow-safe guard before
//! dispatch.

use std::collections::HashMap;

use bytes::Bytes;

use crate::core::packet::{is_inbound, valid_in_var, PacketData, TYPE_TAG_SIZE};
use crate::error::{ProtocolError, Result};
use crate::net::connection::Connection;

/// A packet handler: runs synchronously on the reactor thread with
/// exclusive access to the role state and the originating connection.
pub type Handler<R> = fn(&mut R, &mut Connection, &PacketData) -> Result<()>;

/// Trailer geometry of a variable-length packet.
#[derive(Debug, Clone, Copy)]
pub struct VarSpec {
    /// Byte offset of the `i32` trailer count inside the base struct.
    pub count_offset: usize,
    /// Wire size of one trailer record.
    pub stride: usize,
}

/// Wire geometry of one registered packet type.
#[derive(Debug, Clone, Copy)]
pub struct PacketSpec {
    /// Wire size of the fixed base struct, type tag excluded.
    pub base_size: usize,
    pub var: Option<VarSpec>,
}

/// Immutable packet-type → handler table for one server role.
pub struct PacketTable<R> {
    entries: HashMap<u32, (PacketSpec, Handler<R>)>,
}

impl<R> Default for PacketTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> PacketTable<R> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a fixed-size packet. Panics on a non-inbound type; handler
    /// tables are populated only with inbound families, and a bad
    /// registration is a startup programming error.
    pub fn fixed(mut self, ptype: u32, base_size: usize, handler: Handler<R>) -> Self {
        assert!(is_inbound(ptype), "handler registered for non-inbound type {ptype:#010x}");
        self.entries
            .insert(ptype, (PacketSpec { base_size, var: None }, handler));
        self
    }

    /// Register a variable-length packet with its trailer geometry.
    pub fn variable(
        mut self,
        ptype: u32,
        base_size: usize,
        count_offset: usize,
        stride: usize,
        handler: Handler<R>,
    ) -> Self {
        assert!(is_inbound(ptype), "handler registered for non-inbound type {ptype:#010x}");
        assert!(
            count_offset + 4 <= base_size,
            "trailer count field outside base struct for type {ptype:#010x}"
        );
        self.entries.insert(
            ptype,
            (
                PacketSpec {
                    base_size,
                    var: Some(VarSpec { count_offset, stride }),
                },
                handler,
            ),
        );
        self
    }

    pub fn handler(&self, ptype: u32) -> Option<Handler<R>> {
        self.entries.get(&ptype).map(|(_, h)| *h)
    }

    pub fn spec(&self, ptype: u32) -> Option<&PacketSpec> {
        self.entries.get(&ptype).map(|(s, _)| s)
    }

    /// Validate a decrypted frame against the registered geometry.
    ///
    /// Returns `Ok(None)` for an unknown type (dropped upstream with a log
    /// line, connection lives). A wrong direction family or failed trailer
    /// math is an error, which kills the connection.
    pub fn parse(&self, ptype: u32, frame: Bytes) -> Result<Option<PacketData>> {
        if !is_inbound(ptype) {
            return Err(ProtocolError::BadDirection(ptype));
        }

        if frame.len() < TYPE_TAG_SIZE {
            return Err(ProtocolError::BadFrameLength(frame.len() as u32));
        }
        let payload_size = frame.len() - TYPE_TAG_SIZE;

        let Some((spec, _)) = self.entries.get(&ptype) else {
            return Ok(None);
        };

        match spec.var {
            None => {
                if payload_size != spec.base_size {
                    return Err(ProtocolError::TrailerMismatch {
                        ptype,
                        base: spec.base_size,
                        count: 0,
                        stride: 0,
                        size: payload_size,
                    });
                }
                Ok(Some(PacketData::new(ptype, frame, spec.base_size, 0, 0)))
            }
            Some(var) => {
                // the count field must be present before it can be trusted
                if payload_size < var.count_offset + 4 {
                    return Err(ProtocolError::TrailerMismatch {
                        ptype,
                        base: spec.base_size,
                        count: 0,
                        stride: var.stride,
                        size: payload_size,
                    });
                }

                let at = TYPE_TAG_SIZE + var.count_offset;
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&frame[at..at + 4]);
                let count = i32::from_le_bytes(raw);

                if !valid_in_var(spec.base_size, count, var.stride, payload_size) {
                    return Err(ProtocolError::TrailerMismatch {
                        ptype,
                        base: spec.base_size,
                        count,
                        stride: var.stride,
                        size: payload_size,
                    });
                }

                Ok(Some(PacketData::new(
                    ptype,
                    frame,
                    spec.base_size,
                    count as usize,
                    var.stride,
                )))
            }
        }
    }
}
