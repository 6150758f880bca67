//! # Networking Runtime
//!
//! Connection state, dispatch, timers and the poll reactor that owns them
//! all. Everything here runs on one thread; handlers and timers are
//! invoked synchronously from the reactor tick.

pub mod connection;
pub mod dispatch;
pub mod reactor;
pub mod timer;

pub use connection::{ConnId, Connection, ConnectionTable, KeySlot};
pub use dispatch::{Handler, PacketSpec, PacketTable, VarSpec};
pub use reactor::{Reactor, ServerRole, ShutdownFlag};
pub use timer::TimerSet;
