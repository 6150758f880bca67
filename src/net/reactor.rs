//! # Reactor
//!
//! The single-threaded poll loop that drives everything.
//!
//! One tick is: poll with a short timeout, accept pending connections,
//! service read- and write-ready sockets, offer unrecognized tokens to the
//! role's extra-socket hook, fire due timers, then sweep dead connections.
//! Handlers and timers all run on this thread and must not block; the only
//! suspension point is the poll call itself.
//!
//! Connections are owned exclusively by the reactor. Dispatch borrows one
//! connection for the duration of a handler call; external records refer
//! to connections by [`ConnId`] and go through the table. A connection
//! marked dead anywhere during a tick stays in the table (and emits
//! nothing) until the end-of-tick sweep removes it, so no descriptor is
//! ever serviced twice or removed mid-iteration.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, warn};

use crate::core::packet::PacketData;
use crate::error::{ProtocolError, Result};
use crate::net::connection::{ConnId, Connection, ConnectionTable};
use crate::net::dispatch::PacketTable;
use crate::net::timer::TimerSet;
use crate::utils::metrics::Metrics;
use crate::utils::time::now_ms;

/// Token of the primary listener.
pub const LISTENER: Token = Token(0);

/// Extra listeners (telemetry and the like) get tokens below this bound;
/// connections start here.
const FIRST_CONN_TOKEN: usize = 64;

/// Poll timeout per tick; short enough that no timer fires late by more
/// than its granularity.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Role-specific customization of a server: the dispatch wrapper plus the
/// lifecycle hooks. Two roles exist (login and shard); only their hook
/// bodies and handler tables differ.
pub trait ServerRole: Sized {
    /// Short name for log lines.
    fn name(&self) -> &'static str;

    /// Dispatch one validated packet. The default implementation looks up
    /// the handler and kills the connection if the handler fails; roles
    /// that gate on handshake state wrap this with their own checks.
    fn handle_packet(
        &mut self,
        conn: &mut Connection,
        packet: &PacketData,
        table: &PacketTable<Self>,
    ) {
        let Some(handler) = table.handler(packet.ptype()) else {
            return;
        };

        if let Err(e) = handler(self, conn, packet) {
            warn!(id = %conn.id(), ptype = format_args!("{:#010x}", packet.ptype()),
                  error = %e, "handler failed");
            conn.kill();
        }
    }

    /// Called after a connection is accepted and registered.
    fn new_connection(&mut self, _conn: &mut Connection) {}

    /// Called while a dead connection is being removed.
    fn kill_connection(&mut self, _conn: &mut Connection) {}

    /// Offer readiness on a token the reactor does not recognize. Return
    /// true when the role consumed the event.
    fn check_extra_sockets(&mut self, _token: Token, _readable: bool) -> bool {
        false
    }

    /// Called once when the reactor drains, before connections close.
    fn on_shutdown(&mut self, _conns: &mut ConnectionTable) {}
}

/// Cooperative shutdown signal, shared between the reactor, signal
/// handlers and tests.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The raw flag, in the form `signal_hook::flag::register` expects.
    pub fn as_atomic(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// The poll-based server core, parameterized by its role.
pub struct Reactor<R: ServerRole> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionTable,
    table: PacketTable<R>,
    timers: TimerSet<R>,
    role: R,
    metrics: Arc<Metrics>,
    shutdown: ShutdownFlag,
    next_conn_token: usize,
    next_extra_token: usize,
}

impl<R: ServerRole> Reactor<R> {
    /// Bind the listener and assemble a reactor. The packet table is
    /// immutable from here on.
    pub fn new(addr: SocketAddr, role: R, table: PacketTable<R>) -> Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(256),
            listener,
            connections: ConnectionTable::new(),
            table,
            timers: TimerSet::new(),
            role,
            metrics: Arc::new(Metrics::new()),
            shutdown: ShutdownFlag::new(),
            next_conn_token: FIRST_CONN_TOKEN,
            next_extra_token: LISTENER.0 + 1,
        })
    }

    /// The address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn role(&self) -> &R {
        &self.role
    }

    pub fn role_mut(&mut self) -> &mut R {
        &mut self.role
    }

    pub fn connections(&mut self) -> &mut ConnectionTable {
        &mut self.connections
    }

    /// Register a periodic timer; fired from the tick after all I/O.
    pub fn add_timer<F>(&mut self, delta_ms: u64, handler: F)
    where
        F: FnMut(&mut R, &mut ConnectionTable, u64) + 'static,
    {
        self.timers.register(delta_ms, handler);
    }

    /// Register an auxiliary listener (for example the telemetry channel)
    /// on the same poll. Readiness on the returned token is offered to
    /// the role's `check_extra_sockets` hook.
    pub fn register_extra(&mut self, source: &mut impl Source) -> Result<Token> {
        let token = Token(self.next_extra_token);
        assert!(token.0 < FIRST_CONN_TOKEN, "too many extra listeners");
        self.next_extra_token += 1;

        self.poll
            .registry()
            .register(source, token, Interest::READABLE)?;
        Ok(token)
    }

    /// Run ticks until the shutdown flag flips, then drain.
    pub fn run(&mut self) -> Result<()> {
        info!(
            role = self.role.name(),
            addr = %self.local_addr()?,
            timers = self.timers.len(),
            "server online"
        );

        while !self.shutdown.is_triggered() {
            self.tick()?;
        }

        self.drain();
        Ok(())
    }

    /// One reactor pass: poll, accept, service, extras, timers, sweep.
    pub fn tick(&mut self) -> Result<()> {
        if let Err(e) = self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                // signal delivery; the run loop re-checks the flag
                return Ok(());
            }
            return Err(e.into());
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            match token {
                LISTENER => self.accept_pending(),
                t if t.0 >= FIRST_CONN_TOKEN => self.service_connection(t, readable, writable),
                t => {
                    if !self.role.check_extra_sockets(t, readable) {
                        warn!(token = t.0, "readiness on unclaimed token");
                    }
                }
            }
        }

        self.on_step();
        self.sweep_dead();
        Ok(())
    }

    /// Accept every pending connection on the primary listener.
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_conn_token);
                    self.next_conn_token += 1;

                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        error!(peer = %peer, error = %e, "failed to register new connection");
                        continue;
                    }

                    let mut conn = Connection::new(ConnId(token.0), stream, peer);
                    self.metrics.connection_established();
                    self.role.new_connection(&mut conn);
                    info!(id = %conn.id(), peer = %peer, "new connection");
                    self.connections.insert(conn);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Service one ready connection: flush buffered output, then read and
    /// dispatch frames until the socket would block or the connection
    /// dies.
    fn service_connection(&mut self, token: Token, readable: bool, writable: bool) {
        let id = ConnId(token.0);
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };

        if writable {
            if let Err(e) = conn.try_flush() {
                debug!(id = %id, error = %e, "flush failed");
                conn.kill();
            }
        }

        if readable && conn.is_alive() {
            loop {
                match conn.try_read_frame() {
                    Ok(Some((ptype, frame))) => match self.table.parse(ptype, frame) {
                        Ok(Some(packet)) => {
                            self.metrics.packet_dispatched();
                            self.role.handle_packet(conn, &packet, &self.table);
                            if !conn.is_alive() {
                                break;
                            }
                        }
                        Ok(None) => {
                            self.metrics.packet_dropped();
                            debug!(id = %id, ptype = format_args!("{ptype:#010x}"),
                                   "unknown packet type dropped");
                        }
                        Err(e) => {
                            self.metrics.protocol_error();
                            warn!(id = %id, error = %e, "protocol violation");
                            conn.kill();
                            break;
                        }
                    },
                    Ok(None) => break,
                    Err(ProtocolError::ConnectionClosed) => {
                        info!(id = %id, "peer disconnected");
                        conn.kill();
                        break;
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "read failed");
                        conn.kill();
                        break;
                    }
                }
            }
        }

        self.sync_write_interest(token);
    }

    /// Reconcile the poll registration with the connection's buffered
    /// output so writable events arrive exactly while they are needed.
    fn sync_write_interest(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(ConnId(token.0)) else {
            return;
        };
        if !conn.is_alive() {
            return;
        }

        let wanted = conn.wants_write();
        if wanted == conn.write_interest() {
            return;
        }

        let interest = if wanted {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        match self
            .poll
            .registry()
            .reregister(conn.stream_mut(), token, interest)
        {
            Ok(()) => conn.set_write_interest(wanted),
            Err(e) => {
                warn!(id = %conn.id(), error = %e, "reregister failed");
                conn.kill();
            }
        }
    }

    /// Fire due timers, then reconcile write interest for connections the
    /// timers may have written to.
    fn on_step(&mut self) {
        let now = now_ms();
        self.timers.fire_due(&mut self.role, &mut self.connections, now);

        let pending: Vec<ConnId> = self
            .connections
            .iter_mut()
            .filter(|c| c.is_alive() && c.wants_write() != c.write_interest())
            .map(|c| c.id())
            .collect();
        for id in pending {
            self.sync_write_interest(Token(id.0));
        }
    }

    /// Remove every connection marked dead during this tick.
    fn sweep_dead(&mut self) {
        for id in self.connections.dead_ids() {
            self.close_connection(id);
        }
    }

    fn close_connection(&mut self, id: ConnId) {
        let Some(mut conn) = self.connections.remove(id) else {
            return;
        };

        if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
            debug!(id = %id, error = %e, "deregister failed");
        }

        self.role.kill_connection(&mut conn);
        let _ = conn.stream_mut().shutdown(std::net::Shutdown::Both);
        self.metrics.connection_closed();
        info!(id = %id, peer = %conn.peer_addr(), "connection closed");
    }

    /// Close everything down: the role's final hook (a shard runs its
    /// last save here), then every connection, then the listener.
    fn drain(&mut self) {
        info!(role = self.role.name(), "shutting down");
        self.role.on_shutdown(&mut self.connections);

        for id in self.connections.ids() {
            if let Some(conn) = self.connections.get_mut(id) {
                conn.kill();
            }
            self.close_connection(id);
        }

        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            debug!(error = %e, "listener deregister failed");
        }

        self.metrics.log_summary();
    }
}
