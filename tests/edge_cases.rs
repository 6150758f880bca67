#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Boundary and hostile-input tests for the framing layer: length
//! ceilings, trickled delivery, trailer overflow and key-rotation
//! lockout.

mod common;

use std::io::{self, Read, Write};

use bytes::Bytes;
use shardnet::core::cipher::{derive_key, DEFAULT_KEY};
use shardnet::core::codec::FrameReader;
use shardnet::core::packet::{is_inbound, CLIENT_TO_SHARD, MAX_PACKET_SIZE, TYPE_TAG_SIZE};
use shardnet::error::{ProtocolError, Result};
use shardnet::net::{ConnId, Connection, PacketTable};
use shardnet::service::login::{LoginRequest, REQ_LOGIN};

// ============================================================================
// FRAME LENGTH BOUNDARIES
// ============================================================================

#[test]
fn frame_at_max_size_is_accepted() {
    let (server, mut client, peer) = common::loopback_pair();
    let mut conn = Connection::new(ConnId(64), server, peer);

    // a ciphertext body exactly at the ceiling
    let payload = vec![0x5A; MAX_PACKET_SIZE - TYPE_TAG_SIZE];
    let wire = common::client_frame(CLIENT_TO_SHARD | 1, &payload, &DEFAULT_KEY);
    assert_eq!(wire.len(), 4 + MAX_PACKET_SIZE);
    client.write_all(&wire).unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        match conn.try_read_frame().expect("max-size frame is legal") {
            Some((ptype, frame)) => {
                assert_eq!(ptype, CLIENT_TO_SHARD | 1);
                assert_eq!(frame.len(), MAX_PACKET_SIZE);
                break;
            }
            None => {
                assert!(std::time::Instant::now() < deadline, "frame never completed");
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        }
    }
    assert!(conn.is_alive());
}

#[test]
fn frame_over_max_size_is_fatal() {
    let (server, mut client, peer) = common::loopback_pair();
    let mut conn = Connection::new(ConnId(64), server, peer);

    let declared = (MAX_PACKET_SIZE + 1) as u32;
    client.write_all(&declared.to_le_bytes()).unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        match conn.try_read_frame() {
            Err(ProtocolError::BadFrameLength(n)) => {
                assert_eq!(n, declared);
                break;
            }
            Ok(None) => {
                assert!(std::time::Instant::now() < deadline, "length never arrived");
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            other => panic!("expected BadFrameLength, got {other:?}"),
        }
    }
}

// ============================================================================
// TRICKLED DELIVERY
// ============================================================================

/// Delivers one byte per read with a would-block between every byte,
/// simulating a peer draining through many poll events.
struct Trickle {
    data: Vec<u8>,
    pos: usize,
    starve: bool,
}

impl Read for Trickle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.starve {
            self.starve = false;
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }

        self.starve = true;
        let Some(&byte) = self.data.get(self.pos) else {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        };

        self.pos += 1;
        buf[0] = byte;
        Ok(1)
    }
}

#[test]
fn byte_at_a_time_delivery_parses_exactly_one_packet() {
    let payload = [7u8; 24];
    let wire = common::client_frame(CLIENT_TO_SHARD | 3, &payload, &DEFAULT_KEY);
    let total = wire.len();

    let mut src = Trickle {
        data: wire,
        pos: 0,
        starve: false,
    };
    let mut reader = FrameReader::new();

    let mut frames = 0;
    let mut polls = 0;
    while src.pos < total || reader.mid_frame() {
        polls += 1;
        assert!(polls < 10 * total, "reader stopped making progress");

        if let Some(body) = reader.read_frame(&mut src).expect("clean frame") {
            assert_eq!(body.len(), TYPE_TAG_SIZE + payload.len());
            frames += 1;
        }
    }

    assert_eq!(frames, 1);
    assert!(!reader.mid_frame());
}

// ============================================================================
// TRAILER OVERFLOW
// ============================================================================

struct Flag {
    handler_ran: bool,
}

fn flag_handler(role: &mut Flag, _conn: &mut Connection, _pkt: &shardnet::PacketData) -> Result<()> {
    role.handler_ran = true;
    Ok(())
}

#[test]
fn hostile_trailer_claim_rejected_before_any_handler() {
    let ptype = CLIENT_TO_SHARD | 4;
    let table = PacketTable::<Flag>::new().variable(ptype, 8, 0, 1_000, flag_handler);

    // claims 10,000 trailers of stride 1,000
    let mut payload = Vec::new();
    payload.extend_from_slice(&10_000i32.to_le_bytes());
    payload.extend_from_slice(&[0u8; 4]);

    let mut frame = ptype.to_le_bytes().to_vec();
    frame.extend_from_slice(&payload);

    let flag = Flag { handler_ran: false };
    let res = table.parse(ptype, Bytes::from(frame));

    assert!(matches!(res, Err(ProtocolError::TrailerMismatch { count: 10_000, .. })));
    assert!(!flag.handler_ran);
}

// ============================================================================
// KEY-ROTATION LOCKOUT
// ============================================================================

// Fixed handshake parameters chosen so the stale-key frame demonstrably
// garbles into a type outside both inbound families.
const HS_TIME: u64 = 1_700_000_000_000;
const HS_IV1: i32 = 1;
const HS_IV2: i32 = 2;

#[test]
fn stale_default_key_frame_fails_family_check_after_rotation() {
    let (server, mut client, peer) = common::loopback_pair();
    let mut conn = Connection::new(ConnId(64), server, peer);

    // the login handler installed the derived E-key on this connection
    conn.set_e_key(derive_key(HS_TIME, HS_IV1, HS_IV2));

    // ...but the client keeps encrypting with the default key
    let mut username = [0u8; 32];
    username[..5].copy_from_slice(b"alice");
    let stale = LoginRequest {
        username,
        password: [0; 32],
    };
    let payload = shardnet::core::codec::encode_struct(&stale).unwrap();
    let wire = common::client_frame(REQ_LOGIN, &payload, &DEFAULT_KEY);
    client.write_all(&wire).unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    let (garbled_type, _) = loop {
        match conn.try_read_frame().expect("framing itself is intact") {
            Some(frame) => break frame,
            None => {
                assert!(std::time::Instant::now() < deadline, "frame never completed");
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        }
    };

    // decrypted under the wrong key, the tag lands outside every family
    assert_ne!(garbled_type, REQ_LOGIN);
    assert!(!is_inbound(garbled_type));

    let table = PacketTable::<Flag>::new().fixed(REQ_LOGIN, LoginRequest::WIRE_SIZE, flag_handler);
    let res = table.parse(garbled_type, Bytes::from(vec![0u8; 68]));
    assert!(matches!(res, Err(ProtocolError::BadDirection(_))));
}
