#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end shard behavior through the reactor: the enter handshake
//! with its key rotation, out-of-sequence gating, hostile frames,
//! keepalive and persistence.

mod common;

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shardnet::config::Settings;
use shardnet::core::cipher::{key_bytes, DEFAULT_KEY};
use shardnet::core::codec::encode_struct;
use shardnet::core::packet::{CLIENT_TO_SHARD, SHARD_TO_CLIENT};
use shardnet::net::{ConnId, Connection, ConnectionTable};
use shardnet::service::shard::{
    shard_server, EnterRequest, MemoryStore, MoveUpdate, Player, ShardRole, ENTER_SUCC,
    REQ_ENTER, REQ_LIVE_CHECK, REQ_MOVE,
};
use shardnet::service::{Session, SessionHandoff};
use shardnet::utils::time::now_ms;

type SharedStore = Arc<Mutex<MemoryStore>>;

fn test_settings() -> Settings {
    Settings::default_with_overrides(|s| {
        s.shard.port = 0;
        s.monitor.enabled = false;
    })
}

fn shard_fixture() -> (
    shardnet::Reactor<ShardRole>,
    Arc<SessionHandoff>,
    SharedStore,
) {
    let handoff = Arc::new(SessionHandoff::new());
    let store: SharedStore = Arc::new(Mutex::new(MemoryStore::default()));

    let (reactor, _monitor) = shard_server(&test_settings(), Arc::clone(&handoff), Box::new(Arc::clone(&store)))
        .expect("shard server");
    (reactor, handoff, store)
}

fn enter_payload(serial_key: u64) -> Vec<u8> {
    encode_struct(&EnterRequest { serial_key }).expect("encode")
}

#[test]
fn enter_rotates_to_fe_key_and_gameplay_flows() {
    let (mut reactor, handoff, _store) = shard_fixture();

    let fe_key = 0xFEED_F00D_1234_5678;
    handoff.insert(
        77,
        Session {
            player_name: "renn".into(),
            fe_key,
        },
    );

    let mut client = common::connect_client(&reactor);
    common::tick_until(&mut reactor, "accept", |r| r.connections().len() == 1);

    // enter travels under the default key...
    client
        .write_all(&common::client_frame(REQ_ENTER, &enter_payload(77), &DEFAULT_KEY))
        .unwrap();
    common::tick_until(&mut reactor, "player entered", |r| r.role().player_count() == 1);

    // ...and the response already speaks the FE-key
    let (ptype, payload) = common::read_server_frame(&mut client, &key_bytes(fe_key));
    assert_eq!(ptype, ENTER_SUCC);
    assert_eq!(&payload[..4], &1i32.to_le_bytes());
    assert_eq!(&payload[4..], &1i32.to_le_bytes());
    assert!(handoff.is_empty(), "session consumed");

    // gameplay continues under the rotated key
    let update = encode_struct(&MoveUpdate { x: 12, y: -7 }).unwrap();
    client
        .write_all(&common::client_frame(REQ_MOVE, &update, &key_bytes(fe_key)))
        .unwrap();
    common::tick_until(&mut reactor, "move applied", |r| {
        r.role().players().any(|(_, p)| p.x == 12 && p.y == -7)
    });
}

#[test]
fn gameplay_before_enter_is_dropped_but_connection_lives() {
    let (mut reactor, handoff, _store) = shard_fixture();
    handoff.insert(
        5,
        Session {
            player_name: "renn".into(),
            fe_key: 0x1111_2222_3333_4444,
        },
    );

    let mut client = common::connect_client(&reactor);
    common::tick_until(&mut reactor, "accept", |r| r.connections().len() == 1);

    // gameplay packet before the enter request: dropped, no handler runs
    let update = encode_struct(&MoveUpdate { x: 99, y: 99 }).unwrap();
    client
        .write_all(&common::client_frame(REQ_MOVE, &update, &DEFAULT_KEY))
        .unwrap();

    // the connection survives: the enter that follows on the same stream
    // is processed normally, and the dropped move never touched anything
    client
        .write_all(&common::client_frame(REQ_ENTER, &enter_payload(5), &DEFAULT_KEY))
        .unwrap();
    common::tick_until(&mut reactor, "player entered", |r| r.role().player_count() == 1);

    assert_eq!(reactor.connections().len(), 1);
    let (_, player) = reactor.role().players().next().unwrap();
    assert_eq!((player.x, player.y), (0, 0));
}

#[test]
fn unknown_packet_type_is_dropped_but_connection_lives() {
    let (mut reactor, handoff, _store) = shard_fixture();
    handoff.insert(
        6,
        Session {
            player_name: "renn".into(),
            fe_key: 0x5555_6666_7777_8888,
        },
    );

    let mut client = common::connect_client(&reactor);
    common::tick_until(&mut reactor, "accept", |r| r.connections().len() == 1);

    client
        .write_all(&common::client_frame(CLIENT_TO_SHARD | 0x7F, &[0u8; 8], &DEFAULT_KEY))
        .unwrap();
    client
        .write_all(&common::client_frame(REQ_ENTER, &enter_payload(6), &DEFAULT_KEY))
        .unwrap();

    common::tick_until(&mut reactor, "player entered", |r| r.role().player_count() == 1);
    assert_eq!(reactor.connections().len(), 1);
}

#[test]
fn outbound_family_type_kills_the_connection() {
    let (mut reactor, _handoff, _store) = shard_fixture();

    let mut client = common::connect_client(&reactor);
    common::tick_until(&mut reactor, "accept", |r| r.connections().len() == 1);

    client
        .write_all(&common::client_frame(SHARD_TO_CLIENT | 1, &[0u8; 8], &DEFAULT_KEY))
        .unwrap();
    common::tick_until(&mut reactor, "connection killed", |r| r.connections().is_empty());

    // the peer observes the close
    let mut probe = [0u8; 1];
    assert_eq!(client.read(&mut probe).unwrap(), 0);
}

#[test]
fn keepalive_probes_then_kills() {
    let handoff = Arc::new(SessionHandoff::new());
    let mut role = ShardRole::new(handoff, Box::new(MemoryStore::default()), 60_000);
    let mut conns = ConnectionTable::new();

    let (server, mut client, peer) = common::loopback_pair();
    let id = ConnId(64);
    conns.insert(Connection::new(id, server, peer));

    let now = now_ms();
    role.add_player(
        id,
        Player {
            id: 1,
            name: "renn".into(),
            x: 0,
            y: 0,
            hidden: false,
            last_heartbeat: now - 31_000,
        },
    );

    // 31s silent with a 60s timeout: exactly one live check this tick
    ShardRole::keepalive_timer(&mut role, &mut conns, now);
    let (ptype, _) = common::read_server_frame(&mut client, &DEFAULT_KEY);
    assert_eq!(ptype, REQ_LIVE_CHECK);

    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut probe = [0u8; 1];
    let extra = client.read(&mut probe);
    assert!(
        matches!(&extra, Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
            || e.kind() == std::io::ErrorKind::TimedOut),
        "expected exactly one live check, got {extra:?}"
    );
    assert!(conns.get_mut(id).unwrap().is_alive());

    // 61s silent: thrown out
    role.player_mut(id).unwrap().last_heartbeat = now - 61_000;
    ShardRole::keepalive_timer(&mut role, &mut conns, now);
    assert!(!conns.get_mut(id).unwrap().is_alive());
}

#[test]
fn keepalive_ignores_players_never_heard_from() {
    let handoff = Arc::new(SessionHandoff::new());
    let mut role = ShardRole::new(handoff, Box::new(MemoryStore::default()), 60_000);
    let mut conns = ConnectionTable::new();

    let (server, _client, peer) = common::loopback_pair();
    let id = ConnId(64);
    conns.insert(Connection::new(id, server, peer));
    role.add_player(
        id,
        Player {
            id: 1,
            name: "renn".into(),
            x: 0,
            y: 0,
            hidden: false,
            last_heartbeat: 0,
        },
    );

    ShardRole::keepalive_timer(&mut role, &mut conns, now_ms());
    assert!(conns.get_mut(id).unwrap().is_alive());
}

#[test]
fn periodic_save_persists_every_player() {
    let handoff = Arc::new(SessionHandoff::new());
    let store: SharedStore = Arc::new(Mutex::new(MemoryStore::default()));
    let mut role = ShardRole::new(handoff, Box::new(Arc::clone(&store)), 60_000);
    let mut conns = ConnectionTable::new();

    for i in 1..=3 {
        role.add_player(
            ConnId(64 + i as usize),
            Player {
                id: i,
                name: format!("p{i}"),
                x: i,
                y: -i,
                hidden: false,
                last_heartbeat: now_ms(),
            },
        );
    }

    ShardRole::periodic_save_timer(&mut role, &mut conns, now_ms());

    let saved = store.lock().unwrap();
    assert_eq!(saved.saved.len(), 3);
    assert_eq!(saved.flushes, 1);
    assert_eq!(saved.saved[&2].x, 2);
}

#[test]
fn shutdown_runs_the_final_save_and_closes_connections() {
    let (mut reactor, handoff, store) = shard_fixture();
    handoff.insert(
        8,
        Session {
            player_name: "renn".into(),
            fe_key: 0x9999_AAAA_BBBB_CCCC,
        },
    );

    let mut client = common::connect_client(&reactor);
    common::tick_until(&mut reactor, "accept", |r| r.connections().len() == 1);
    client
        .write_all(&common::client_frame(REQ_ENTER, &enter_payload(8), &DEFAULT_KEY))
        .unwrap();
    common::tick_until(&mut reactor, "player entered", |r| r.role().player_count() == 1);

    reactor.shutdown_flag().trigger();
    reactor.run().expect("drain");

    let saved = store.lock().unwrap();
    assert!(saved.saved.values().any(|p| p.name == "renn"));
    assert!(saved.flushes >= 1);
    drop(saved);

    // skip whatever was queued, then observe the close
    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest);
}
