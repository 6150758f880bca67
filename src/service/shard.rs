//! # Shard Role
//!
//! Hosts entered players: enter-gating, keepalive, periodic persistence
//! and the telemetry feed.
//!
//! A connection crossing into the shard still speaks the default key; the
//! enter request presents the serial key issued at login, and a valid one
//! installs the FE-key and flips the active slot before the response goes
//! out. Gameplay packets from connections that never entered are dropped,
//! with the enter request and the live-check reply whitelisted so the
//! handshake itself can happen.

use std::collections::HashMap;
use std::sync::Arc;

use mio::Token;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::core::packet::{CLIENT_TO_SHARD, SHARD_TO_CLIENT};
use crate::core::PacketData;
use crate::error::Result;
use crate::monitor::Monitor;
use crate::net::connection::{ConnId, Connection, ConnectionTable, KeySlot};
use crate::net::dispatch::PacketTable;
use crate::net::reactor::{Reactor, ServerRole};
use crate::service::SessionHandoff;
use crate::utils::time::now_ms;

pub const REQ_ENTER: u32 = CLIENT_TO_SHARD | 0x01;
pub const REP_LIVE_CHECK: u32 = CLIENT_TO_SHARD | 0x02;
pub const REQ_MOVE: u32 = CLIENT_TO_SHARD | 0x03;

pub const ENTER_SUCC: u32 = SHARD_TO_CLIENT | 0x01;
pub const REQ_LIVE_CHECK: u32 = SHARD_TO_CLIENT | 0x02;

/// Keepalive timer cadence.
pub const KEEPALIVE_INTERVAL_MS: u64 = 4_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnterRequest {
    pub serial_key: u64,
}

impl EnterRequest {
    pub const WIRE_SIZE: usize = 8;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnterSucc {
    pub player_id: i32,
    pub result: i32,
}

impl EnterSucc {
    pub const WIRE_SIZE: usize = 8;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveCheck {
    pub temp_value: i32,
}

impl LiveCheck {
    pub const WIRE_SIZE: usize = 4;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveUpdate {
    pub x: i32,
    pub y: i32,
}

impl MoveUpdate {
    pub const WIRE_SIZE: usize = 8;
}

/// One entered player. The record holds its connection id, never a
/// reference; the reactor owns the connection itself.
#[derive(Debug, Clone)]
pub struct Player {
    pub id: i32,
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub hidden: bool,
    /// Millisecond timestamp of the last packet; zero until first seen.
    pub last_heartbeat: u64,
}

/// Persistence seam for player records. The real database lives outside
/// the runtime; tests use [`MemoryStore`].
pub trait PlayerStore {
    fn save_player(&mut self, player: &Player) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Store that remembers what was saved; the default for tests and
/// standalone runs.
#[derive(Default)]
pub struct MemoryStore {
    pub saved: HashMap<i32, Player>,
    pub flushes: u32,
}

impl PlayerStore for MemoryStore {
    fn save_player(&mut self, player: &Player) -> Result<()> {
        self.saved.insert(player.id, player.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

/// A store shared with code outside the reactor (operator tooling, tests)
/// keeps working through a mutex.
impl<S: PlayerStore> PlayerStore for Arc<std::sync::Mutex<S>> {
    fn save_player(&mut self, player: &Player) -> Result<()> {
        match self.lock() {
            Ok(mut guard) => guard.save_player(player),
            Err(poisoned) => poisoned.into_inner().save_player(player),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self.lock() {
            Ok(mut guard) => guard.flush(),
            Err(poisoned) => poisoned.into_inner().flush(),
        }
    }
}

/// The shard server role.
pub struct ShardRole {
    players: HashMap<ConnId, Player>,
    store: Box<dyn PlayerStore>,
    handoff: Arc<SessionHandoff>,
    monitor: Option<Arc<Monitor>>,
    monitor_token: Option<Token>,
    timeout_ms: u64,
}

impl ShardRole {
    pub fn new(handoff: Arc<SessionHandoff>, store: Box<dyn PlayerStore>, timeout_ms: u64) -> Self {
        Self {
            players: HashMap::new(),
            store,
            handoff,
            monitor: None,
            monitor_token: None,
            timeout_ms,
        }
    }

    /// Attach the telemetry channel; its listener token routes through
    /// the extra-socket hook.
    pub fn attach_monitor(&mut self, monitor: Arc<Monitor>, token: Token) {
        self.monitor = Some(monitor);
        self.monitor_token = Some(token);
    }

    pub fn monitor(&self) -> Option<&Arc<Monitor>> {
        self.monitor.as_ref()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn player(&self, id: ConnId) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn player_mut(&mut self, id: ConnId) -> Option<&mut Player> {
        self.players.get_mut(&id)
    }

    pub fn players(&self) -> impl Iterator<Item = (&ConnId, &Player)> {
        self.players.iter()
    }

    /// Insert a player record directly, bypassing the enter handshake.
    /// Gameplay systems use this for transfers between shards.
    pub fn add_player(&mut self, id: ConnId, player: Player) {
        self.players.insert(id, player);
    }

    /// Kill silent connections; probe half-silent ones with a live check.
    pub fn keepalive_timer(role: &mut Self, conns: &mut ConnectionTable, now: u64) {
        for (&id, player) in &role.players {
            if player.last_heartbeat == 0 {
                continue;
            }

            let silent_for = now.saturating_sub(player.last_heartbeat);
            let Some(conn) = conns.get_mut(id) else {
                continue;
            };

            if silent_for > role.timeout_ms {
                // dead client, throw it out
                info!(id = %id, player = %player.name, "keepalive timeout");
                conn.kill();
            } else if silent_for > role.timeout_ms / 2 {
                if let Err(e) = conn.send_packet(REQ_LIVE_CHECK, &LiveCheck { temp_value: 0 }) {
                    warn!(id = %id, error = %e, "live check send failed");
                }
            }
        }
    }

    /// Persist every player and flush dynamic tables.
    pub fn periodic_save_timer(role: &mut Self, _conns: &mut ConnectionTable, _now: u64) {
        if role.players.is_empty() {
            return;
        }

        info!(players = role.players.len(), "saving players");
        role.save_all();
    }

    /// Push one telemetry frame with the current visible players.
    pub fn monitor_timer(role: &mut Self, _conns: &mut ConnectionTable, _now: u64) {
        role.monitor_tick();
    }

    fn monitor_tick(&self) {
        let Some(monitor) = &self.monitor else {
            return;
        };

        let marks: Vec<(i32, i32, &str)> = self
            .players
            .values()
            .filter(|p| !p.hidden)
            .map(|p| (p.x, p.y, p.name.as_str()))
            .collect();

        monitor.tick(&marks);
    }

    fn save_all(&mut self) {
        for player in self.players.values() {
            if let Err(e) = self.store.save_player(player) {
                warn!(player = %player.name, error = %e, "player save failed");
            }
        }

        if let Err(e) = self.store.flush() {
            warn!(error = %e, "table flush failed");
        }
    }

    fn on_enter(&mut self, conn: &mut Connection, req: &EnterRequest) -> Result<()> {
        let Some(session) = self.handoff.take(req.serial_key) else {
            warn!(id = %conn.id(), serial_key = req.serial_key, "enter with unknown serial key");
            conn.kill();
            return Ok(());
        };

        // rotate onto the shard key before anything goes back out
        conn.set_fe_key(session.fe_key);
        conn.set_active_key(KeySlot::Fe);

        let player_id = self.players.len() as i32 + 1;
        self.players.insert(
            conn.id(),
            Player {
                id: player_id,
                name: session.player_name.clone(),
                x: 0,
                y: 0,
                hidden: false,
                last_heartbeat: now_ms(),
            },
        );

        conn.send_packet(ENTER_SUCC, &EnterSucc { player_id, result: 1 })?;
        info!(id = %conn.id(), player = %session.player_name, player_id, "player entered");
        Ok(())
    }
}

impl ServerRole for ShardRole {
    fn name(&self) -> &'static str {
        "shard"
    }

    fn handle_packet(
        &mut self,
        conn: &mut Connection,
        packet: &PacketData,
        table: &PacketTable<Self>,
    ) {
        let ptype = packet.ptype();
        let Some(handler) = table.handler(ptype) else {
            return;
        };

        // reject gameplay packets until the connection has entered
        if !self.players.contains_key(&conn.id())
            && ptype != REQ_ENTER
            && ptype != REP_LIVE_CHECK
        {
            debug!(id = %conn.id(), ptype = format_args!("{ptype:#010x}"),
                   "packet out of sequence, dropped");
            return;
        }

        if let Err(e) = handler(self, conn, packet) {
            warn!(id = %conn.id(), ptype = format_args!("{ptype:#010x}"),
                  error = %e, "handler failed");
            conn.kill();
        }

        // the handler may have dropped the player; only then skip the touch
        if let Some(player) = self.players.get_mut(&conn.id()) {
            player.last_heartbeat = now_ms();
        }
    }

    fn new_connection(&mut self, conn: &mut Connection) {
        // fresh shard connections accept traffic under the default key
        conn.set_active_key(KeySlot::E);
    }

    fn kill_connection(&mut self, conn: &mut Connection) {
        // only connections that entered have a player to persist
        let Some(player) = self.players.remove(&conn.id()) else {
            return;
        };

        info!(id = %conn.id(), player = %player.name, "removing player");
        if let Err(e) = self.store.save_player(&player) {
            warn!(player = %player.name, error = %e, "final player save failed");
        }
    }

    fn check_extra_sockets(&mut self, token: Token, readable: bool) -> bool {
        if Some(token) != self.monitor_token {
            return false;
        }

        if readable {
            if let Some(monitor) = &self.monitor {
                monitor.accept_pending();
            }
        }
        true
    }

    fn on_shutdown(&mut self, _conns: &mut ConnectionTable) {
        // final flush before the connections go away
        self.save_all();
    }
}

fn handle_enter(role: &mut ShardRole, conn: &mut Connection, pkt: &PacketData) -> Result<()> {
    let req: EnterRequest = pkt.decode()?;
    role.on_enter(conn, &req)
}

fn handle_live_check(_role: &mut ShardRole, _conn: &mut Connection, _pkt: &PacketData) -> Result<()> {
    // the dispatch wrapper already refreshed the heartbeat
    Ok(())
}

fn handle_move(role: &mut ShardRole, conn: &mut Connection, pkt: &PacketData) -> Result<()> {
    let update: MoveUpdate = pkt.decode()?;

    if let Some(player) = role.players.get_mut(&conn.id()) {
        player.x = update.x;
        player.y = update.y;
    }
    Ok(())
}

/// The shard role's immutable handler table.
pub fn packet_table() -> PacketTable<ShardRole> {
    PacketTable::new()
        .fixed(REQ_ENTER, EnterRequest::WIRE_SIZE, handle_enter)
        .fixed(REP_LIVE_CHECK, LiveCheck::WIRE_SIZE, handle_live_check)
        .fixed(REQ_MOVE, MoveUpdate::WIRE_SIZE, handle_move)
}

/// Assemble a ready-to-run shard server from settings: reactor, timers
/// and (when enabled) the telemetry channel.
pub fn shard_server(
    settings: &Settings,
    handoff: Arc<SessionHandoff>,
    store: Box<dyn PlayerStore>,
) -> Result<(Reactor<ShardRole>, Option<Arc<Monitor>>)> {
    let role = ShardRole::new(handoff, store, settings.shard.timeout.as_millis() as u64);
    let mut reactor = Reactor::new(settings.shard.listen_addr()?, role, packet_table())?;

    reactor.add_timer(KEEPALIVE_INTERVAL_MS, ShardRole::keepalive_timer);
    reactor.add_timer(
        settings.shard.db_save_interval.as_millis() as u64,
        ShardRole::periodic_save_timer,
    );

    let monitor = if settings.monitor.enabled {
        let mut monitor = Monitor::bind(settings.monitor.listen_addr()?)?;
        let token = reactor.register_extra(monitor.listener_mut())?;
        let monitor = Arc::new(monitor);

        reactor.role_mut().attach_monitor(Arc::clone(&monitor), token);
        reactor.add_timer(
            settings.monitor.interval.as_millis() as u64,
            ShardRole::monitor_timer,
        );
        Some(monitor)
    } else {
        None
    };

    Ok((reactor, monitor))
}
