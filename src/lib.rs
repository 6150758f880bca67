//! # shardnet
//!
//! Connection runtime for a networked game server: a protocol framer,
//! per-connection cryptographic state machine, dispatch table, timer set
//! and polling reactor that together turn a TCP listener into a stream of
//! typed, authenticated application packets — and back.
//!
//! ## Wire format
//!
//! ```text
//! [u32 LE length]            covers everything after itself
//! [length bytes ciphertext]  byte-swapped, then XORed with the 8-byte key
//!     [u32 LE type]          high bits encode the direction family
//!     [base struct]          fixed, per-type
//!     [trailers]             optional variable-length records
//! ```
//!
//! Connections bootstrap on a well-known default key, rotate to a derived
//! E-key after login, and to an FE-key after crossing into a shard. All
//! I/O is non-blocking and served by a single-threaded poll loop that
//! also drives periodic timers and the ASCII telemetry side-channel.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shardnet::config::Settings;
//! use shardnet::service::{shard, SessionHandoff};
//!
//! fn main() -> shardnet::error::Result<()> {
//!     let settings = Settings::default();
//!     let handoff = Arc::new(SessionHandoff::new());
//!     let store = Box::new(shard::MemoryStore::default());
//!
//!     let (mut server, _monitor) = shard::shard_server(&settings, handoff, store)?;
//!     server.run()
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod monitor;
pub mod net;
pub mod service;
pub mod utils;

pub use crate::core::{FrameReader, PacketData, MAX_PACKET_SIZE};
pub use crate::error::{ProtocolError, Result};
pub use crate::net::{ConnId, Connection, ConnectionTable, KeySlot, PacketTable, Reactor, ServerRole, ShutdownFlag};
