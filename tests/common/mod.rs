//! Shared helpers for the integration tests: client-side framing and
//! loopback socket plumbing.

#![allow(dead_code)]

use std::io::Read;
use std::net::{SocketAddr, TcpListener as StdListener, TcpStream as StdStream};
use std::time::Duration;

use shardnet::core::cipher;
use shardnet::net::{Reactor, ServerRole};

/// Build one client-side frame: length prefix plus the encrypted type tag
/// and payload, exactly as a game client would put it on the wire.
pub fn client_frame(ptype: u32, payload: &[u8], key: &[u8; 8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.extend_from_slice(&ptype.to_le_bytes());
    body.extend_from_slice(payload);
    cipher::encrypt(&mut body, key);

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Read and decrypt one server frame from a blocking client stream.
pub fn read_server_frame(stream: &mut StdStream, key: &[u8; 8]) -> (u32, Vec<u8>) {
    let mut len_raw = [0u8; 4];
    stream.read_exact(&mut len_raw).expect("frame length");
    let len = u32::from_le_bytes(len_raw) as usize;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).expect("frame body");
    cipher::decrypt(&mut body, key);

    let ptype = u32::from_le_bytes(body[..4].try_into().expect("type tag"));
    (ptype, body[4..].to_vec())
}

/// An accepted non-blocking server stream paired with a blocking client.
pub fn loopback_pair() -> (mio::net::TcpStream, StdStream, SocketAddr) {
    let listener = StdListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");

    let client = StdStream::connect(addr).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("read timeout");

    let (server, peer) = listener.accept().expect("accept");
    server.set_nonblocking(true).expect("nonblocking");

    (mio::net::TcpStream::from_std(server), client, peer)
}

/// Connect a blocking client to a reactor's listener.
pub fn connect_client<R: ServerRole>(reactor: &Reactor<R>) -> StdStream {
    let addr = reactor.local_addr().expect("listener addr");
    let client = StdStream::connect(addr).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("read timeout");
    client
}

/// Drive reactor ticks until `cond` holds; panics after a generous bound.
pub fn tick_until<R: ServerRole>(
    reactor: &mut Reactor<R>,
    what: &str,
    mut cond: impl FnMut(&mut Reactor<R>) -> bool,
) {
    for _ in 0..200 {
        reactor.tick().expect("tick");
        if cond(reactor) {
            return;
        }
    }
    panic!("never reached: {what}");
}
