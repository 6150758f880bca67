//! # Connection
//!
//! Per-socket state for one accepted client.
//!
//! A connection owns its non-blocking stream, a resumable frame reader, an
//! outbound write buffer, and the two session keys with the active-slot
//! selector that decides which of them encrypts and decrypts traffic.
//!
//! ## Key slots
//! The protocol rotates keys mid-stream: a client begins under the shared
//! default key, switches to the E-key after the login handshake, and to the
//! FE-key after crossing into a shard. Both keys start out as the default
//! key so the bootstrap traffic decodes without special cases; handlers
//! install derived keys and flip the active slot explicitly.
//!
//! ## Write path
//! `send_packet` builds the complete frame and attempts to flush it
//! immediately. Whatever the kernel does not accept stays in the write
//! buffer and is retried when the reactor observes writability, so a slow
//! peer never truncates a frame.

use std::io::{self, Write};
use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use serde::Serialize;
use tracing::{debug, trace};

use crate::core::cipher::{self, KEY_LENGTH};
use crate::core::codec::{self, FrameReader};
use crate::core::packet::valid_out_var;
use crate::error::{ProtocolError, Result};

/// Stable identifier for a connection, valid for its whole lifetime.
///
/// External records (players, session registries) hold the id rather than
/// any direct reference; the reactor owns the connection itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub usize);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Which of the two per-connection keys is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    E,
    Fe,
}

/// One accepted client socket and its protocol state.
pub struct Connection {
    id: ConnId,
    stream: TcpStream,
    peer: SocketAddr,

    e_key: u64,
    fe_key: u64,
    active_key: KeySlot,

    reader: FrameReader,
    write_buf: BytesMut,
    alive: bool,

    /// Whether the current poll registration includes writable interest.
    registered_write: bool,
}

impl Connection {
    /// Wrap a freshly accepted stream. Both key slots start as the
    /// well-known default key with the E slot active.
    pub fn new(id: ConnId, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id,
            stream,
            peer,
            e_key: cipher::default_key_u64(),
            fe_key: cipher::default_key_u64(),
            active_key: KeySlot::E,
            reader: FrameReader::new(),
            write_buf: BytesMut::new(),
            alive: true,
            registered_write: false,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn set_e_key(&mut self, key: u64) {
        self.e_key = key;
    }

    pub fn set_fe_key(&mut self, key: u64) {
        self.fe_key = key;
    }

    pub fn e_key(&self) -> u64 {
        self.e_key
    }

    pub fn fe_key(&self) -> u64 {
        self.fe_key
    }

    /// Select which key slot encrypts and decrypts from now on.
    pub fn set_active_key(&mut self, slot: KeySlot) {
        trace!(id = %self.id, ?slot, "switching active key slot");
        self.active_key = slot;
    }

    pub fn active_key(&self) -> KeySlot {
        self.active_key
    }

    fn active_key_bytes(&self) -> [u8; KEY_LENGTH] {
        match self.active_key {
            KeySlot::E => cipher::key_bytes(self.e_key),
            KeySlot::Fe => cipher::key_bytes(self.fe_key),
        }
    }

    /// Mark the connection dead. The reactor removes it at the end of the
    /// current tick; no further packets are emitted or dispatched.
    pub fn kill(&mut self) {
        if self.alive {
            debug!(id = %self.id, peer = %self.peer, "connection killed");
            self.alive = false;
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Attempt to complete one inbound frame.
    ///
    /// Returns the packet type tag and the decrypted frame (tag included)
    /// once a whole frame has arrived, or `None` while bytes are still
    /// outstanding. Errors are fatal to the connection and are mapped to a
    /// kill by the reactor.
    pub fn try_read_frame(&mut self) -> Result<Option<(u32, Bytes)>> {
        let key = self.active_key_bytes();

        let Some(body) = self.reader.read_frame(&mut self.stream)? else {
            return Ok(None);
        };

        cipher::decrypt(body, &key);

        // The frame length validator guarantees at least the type tag.
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&body[..4]);
        Ok(Some((u32::from_le_bytes(tag), Bytes::copy_from_slice(body))))
    }

    /// Serialize, encrypt and queue a fixed-size packet, flushing as much
    /// as the socket will take right away.
    pub fn send_packet<T: Serialize>(&mut self, ptype: u32, packet: &T) -> Result<()> {
        let payload = codec::encode_struct(packet)?;
        self.queue_frame(ptype, &payload)
    }

    /// Serialize, encrypt and queue a variable-length packet: the base
    /// struct followed by `trailers`. The trailer math is validated with
    /// the same overflow-safe guard the parser uses.
    pub fn send_packet_with_trailers<T, U>(
        &mut self,
        ptype: u32,
        base: &T,
        trailers: &[U],
    ) -> Result<()>
    where
        T: Serialize,
        U: Serialize,
    {
        let mut payload = codec::encode_struct(base)?;
        let base_size = payload.len();

        let stride = match trailers.first() {
            Some(first) => codec::struct_size(first)?,
            None => 0,
        };

        if !valid_out_var(base_size, trailers.len() as i32, stride) {
            return Err(ProtocolError::TrailerMismatch {
                ptype,
                base: base_size,
                count: trailers.len() as i32,
                stride,
                size: base_size.saturating_add(trailers.len().saturating_mul(stride)),
            });
        }

        for trailer in trailers {
            payload.extend(codec::encode_struct(trailer)?);
        }

        self.queue_frame(ptype, &payload)
    }

    fn queue_frame(&mut self, ptype: u32, payload: &[u8]) -> Result<()> {
        if !self.alive {
            // in-flight sends to a just-killed connection are dropped
            return Ok(());
        }

        let key = self.active_key_bytes();
        let frame = codec::build_frame(ptype, payload, &key)?;
        self.write_buf.extend_from_slice(&frame);

        self.try_flush()
    }

    /// Push buffered outbound bytes into the socket until it would block
    /// or the buffer drains.
    pub fn try_flush(&mut self) -> Result<()> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(ProtocolError::ConnectionClosed),
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// True when buffered output is waiting for the socket to become
    /// writable again.
    pub fn wants_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn write_interest(&self) -> bool {
        self.registered_write
    }

    pub(crate) fn set_write_interest(&mut self, registered: bool) {
        self.registered_write = registered;
    }
}

/// The reactor's exclusive map of live connections, keyed by id.
///
/// Timer handlers and role hooks receive `&mut ConnectionTable` so they can
/// send to or kill any connection; removal happens only in the reactor's
/// end-of-tick sweep, which keeps iteration here safe.
#[derive(Default)]
pub struct ConnectionTable {
    map: std::collections::HashMap<ConnId, Connection>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.map.get_mut(&id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.map.values_mut()
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.map.keys().copied().collect()
    }

    pub fn insert(&mut self, conn: Connection) {
        self.map.insert(conn.id(), conn);
    }

    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        self.map.remove(&id)
    }

    /// Ids of connections marked dead, due for the end-of-tick sweep.
    pub(crate) fn dead_ids(&self) -> Vec<ConnId> {
        self.map
            .iter()
            .filter(|(_, c)| !c.is_alive())
            .map(|(id, _)| *id)
            .collect()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("active_key", &self.active_key)
            .field("alive", &self.alive)
            .field("pending_out", &self.write_buf.len())
            .finish()
    }
}
