//! # Login Role
//!
//! Authenticates clients over the bootstrap key and rotates them onto a
//! derived session key.
//!
//! A new connection talks under the shared default key. The login request
//! is answered under that same key with the server time and two
//! initialization integers; both sides then derive the E-key from those
//! values, and every later frame on this connection uses it. A serial key
//! in the response lets the client cross into a shard, which installs the
//! FE-key generated here.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::cipher::derive_key;
use crate::core::packet::{CLIENT_TO_LOGIN, LOGIN_TO_CLIENT};
use crate::error::Result;
use crate::net::connection::{Connection, KeySlot};
use crate::net::dispatch::PacketTable;
use crate::net::reactor::{Reactor, ServerRole};
use crate::service::{fixed_str, Session, SessionHandoff};
use crate::utils::time::now_ms;

pub const REQ_LOGIN: u32 = CLIENT_TO_LOGIN | 0x01;
pub const LOGIN_SUCC: u32 = LOGIN_TO_CLIENT | 0x01;
pub const LOGIN_FAIL: u32 = LOGIN_TO_CLIENT | 0x02;

/// Client login request: NUL-padded credential fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: [u8; 32],
    pub password: [u8; 32],
}

impl LoginRequest {
    pub const WIRE_SIZE: usize = 64;
}

/// Successful login: key-derivation inputs plus the shard handoff key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginSucc {
    pub server_time_ms: u64,
    pub iv1: i32,
    pub iv2: i32,
    pub serial_key: u64,
    pub player_id: i32,
}

impl LoginSucc {
    pub const WIRE_SIZE: usize = 28;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginFail {
    pub reason: i32,
}

impl LoginFail {
    pub const WIRE_SIZE: usize = 4;
}

pub const LOGIN_FAIL_BAD_NAME: i32 = 1;

/// The login server role: hands sessions to the shard and installs
/// derived keys.
pub struct LoginRole {
    handoff: Arc<SessionHandoff>,
    login_seq: u32,
    next_player_id: i32,
}

impl LoginRole {
    pub fn new(handoff: Arc<SessionHandoff>) -> Self {
        Self {
            handoff,
            login_seq: 0,
            next_player_id: 1,
        }
    }

    fn on_login(&mut self, conn: &mut Connection, req: &LoginRequest) -> Result<()> {
        let username = fixed_str(&req.username);
        if username.is_empty() {
            warn!(id = %conn.id(), "login with empty username");
            conn.send_packet(LOGIN_FAIL, &LoginFail { reason: LOGIN_FAIL_BAD_NAME })?;
            conn.kill();
            return Ok(());
        }

        self.login_seq = self.login_seq.wrapping_add(1);
        let player_id = self.next_player_id;
        self.next_player_id += 1;

        let server_time_ms = now_ms();
        let iv1 = self.login_seq as i32;
        let iv2 = player_id.wrapping_add(username.len() as i32);

        let serial_key = (server_time_ms << 16) | u64::from(self.login_seq & 0xFFFF);
        let fe_key = derive_key(server_time_ms, iv2, iv1);

        self.handoff.insert(
            serial_key,
            Session {
                player_name: username.to_owned(),
                fe_key,
            },
        );

        // the response still travels under the key the request used
        conn.send_packet(
            LOGIN_SUCC,
            &LoginSucc {
                server_time_ms,
                iv1,
                iv2,
                serial_key,
                player_id,
            },
        )?;

        // from here on, both sides speak the derived E-key
        conn.set_e_key(derive_key(server_time_ms, iv1, iv2));
        conn.set_active_key(KeySlot::E);

        info!(id = %conn.id(), username, player_id, "login accepted");
        Ok(())
    }
}

impl ServerRole for LoginRole {
    fn name(&self) -> &'static str {
        "login"
    }
}

fn handle_login(role: &mut LoginRole, conn: &mut Connection, pkt: &crate::core::PacketData) -> Result<()> {
    let req: LoginRequest = pkt.decode()?;
    role.on_login(conn, &req)
}

/// The login role's immutable handler table.
pub fn packet_table() -> PacketTable<LoginRole> {
    PacketTable::new().fixed(REQ_LOGIN, LoginRequest::WIRE_SIZE, handle_login)
}

/// Assemble a ready-to-run login server.
pub fn login_server(addr: SocketAddr, handoff: Arc<SessionHandoff>) -> Result<Reactor<LoginRole>> {
    Reactor::new(addr, LoginRole::new(handoff), packet_table())
}
