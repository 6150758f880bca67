//! # Frame Codec
//!
//! Length-prefixed framing over non-blocking byte streams.
//!
//! A frame on the wire is a `u32` little-endian length followed by exactly
//! that many bytes of ciphertext. The length covers everything after
//! itself and must satisfy `4 < length <= MAX_PACKET_SIZE`; anything else
//! is a protocol violation that kills the connection.
//!
//! [`FrameReader`] accumulates one frame at a time across partial reads.
//! Would-block pauses the accumulation with all progress kept; the next
//! readiness event resumes exactly where the previous one stopped, so a
//! body delivered one byte per poll still parses as a single frame.

use std::io::{self, Read};

use bytes::{BufMut, BytesMut};

use crate::core::cipher::{self, KEY_LENGTH};
use crate::core::packet::{is_outbound, MAX_PACKET_SIZE, TYPE_TAG_SIZE};
use crate::error::{ProtocolError, Result};

/// Size of the frame length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Resumable reader for one length-prefixed frame.
///
/// The reader owns a fixed buffer of `MAX_PACKET_SIZE` bytes; the frame
/// length is validated before a single body byte is accepted, so the
/// buffer can never be advanced past the ceiling.
pub struct FrameReader {
    header: [u8; LENGTH_PREFIX_SIZE],
    header_filled: usize,
    body: Box<[u8]>,
    /// Expected body length; zero while the length prefix is incomplete.
    body_len: usize,
    body_filled: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            header: [0; LENGTH_PREFIX_SIZE],
            header_filled: 0,
            body: vec![0; MAX_PACKET_SIZE].into_boxed_slice(),
            body_len: 0,
            body_filled: 0,
        }
    }

    /// True while a frame is partially accumulated.
    pub fn mid_frame(&self) -> bool {
        self.header_filled > 0 || self.body_len > 0
    }

    /// Pull bytes from `src` until one frame completes or the source would
    /// block.
    ///
    /// Returns `Ok(Some(body))` with the complete ciphertext body,
    /// `Ok(None)` when more bytes are needed, and an error when the peer
    /// closed, the socket failed, or the declared length is out of bounds.
    /// The returned slice is valid until the next call.
    pub fn read_frame(&mut self, src: &mut impl Read) -> Result<Option<&mut [u8]>> {
        // length prefix first
        while self.body_len == 0 {
            match read_some(src, &mut self.header[self.header_filled..])? {
                None => return Ok(None),
                Some(n) => self.header_filled += n,
            }

            if self.header_filled < LENGTH_PREFIX_SIZE {
                continue;
            }

            let declared = u32::from_le_bytes(self.header);
            if declared as usize <= LENGTH_PREFIX_SIZE || declared as usize > MAX_PACKET_SIZE {
                return Err(ProtocolError::BadFrameLength(declared));
            }

            self.body_len = declared as usize;
            self.body_filled = 0;
        }

        // then the body
        while self.body_filled < self.body_len {
            match read_some(src, &mut self.body[self.body_filled..self.body_len])? {
                None => return Ok(None),
                Some(n) => self.body_filled += n,
            }
        }

        // frame complete; reset state before lending out the buffer
        let len = self.body_len;
        self.header_filled = 0;
        self.body_len = 0;
        self.body_filled = 0;

        Ok(Some(&mut self.body[..len]))
    }
}

/// Read into `buf`, translating would-block into `None` and peer close
/// into an error. Interrupted reads are retried.
fn read_some(src: &mut impl Read, buf: &mut [u8]) -> Result<Option<usize>> {
    loop {
        match src.read(buf) {
            Ok(0) => return Err(ProtocolError::ConnectionClosed),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Build a complete outbound frame: length prefix plus the encrypted
/// type tag and payload.
///
/// The packet type must belong to an outbound family and the resulting
/// body must fit under `MAX_PACKET_SIZE`.
pub fn build_frame(ptype: u32, payload: &[u8], key: &[u8; KEY_LENGTH]) -> Result<BytesMut> {
    if !is_outbound(ptype) {
        return Err(ProtocolError::BadDirection(ptype));
    }

    let body_len = TYPE_TAG_SIZE + payload.len();
    if body_len > MAX_PACKET_SIZE {
        return Err(ProtocolError::OversizedPacket(body_len));
    }

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body_len);
    frame.put_u32_le(body_len as u32);
    frame.put_u32_le(ptype);
    frame.put_slice(payload);

    cipher::encrypt(&mut frame[LENGTH_PREFIX_SIZE..], key);
    Ok(frame)
}

/// Serialize a packet struct into its packed little-endian wire form.
pub fn encode_struct<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
}

/// Wire size of a packet struct.
pub fn struct_size<T: serde::Serialize>(value: &T) -> Result<usize> {
    bincode::serialized_size(value)
        .map(|n| n as usize)
        .map_err(|e| ProtocolError::SerializeError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cipher::DEFAULT_KEY;
    use crate::core::packet::SHARD_TO_CLIENT;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip_through_reader() {
        let ptype = SHARD_TO_CLIENT | 0x42;
        let payload = [9u8; 20];
        let frame = build_frame(ptype, &payload, &DEFAULT_KEY).unwrap();

        let mut reader = FrameReader::new();
        let mut src = Cursor::new(frame.to_vec());
        let body = reader
            .read_frame(&mut src)
            .unwrap()
            .expect("one whole frame available");

        cipher::decrypt(body, &DEFAULT_KEY);
        assert_eq!(u32::from_le_bytes(body[..4].try_into().unwrap()), ptype);
        assert_eq!(&body[4..], &payload);
        assert!(!reader.mid_frame());
    }

    #[test]
    fn rejects_undersized_length() {
        let mut reader = FrameReader::new();
        let mut src = Cursor::new(4u32.to_le_bytes().to_vec());

        let err = reader.read_frame(&mut src).unwrap_err();
        assert!(matches!(err, ProtocolError::BadFrameLength(4)));
    }

    #[test]
    fn rejects_oversized_length() {
        let mut reader = FrameReader::new();
        let declared = (MAX_PACKET_SIZE + 1) as u32;
        let mut src = Cursor::new(declared.to_le_bytes().to_vec());

        let err = reader.read_frame(&mut src).unwrap_err();
        assert!(matches!(err, ProtocolError::BadFrameLength(n) if n == declared));
    }

    #[test]
    fn accepts_length_at_ceiling() {
        let mut bytes = (MAX_PACKET_SIZE as u32).to_le_bytes().to_vec();
        bytes.extend(std::iter::repeat(0xA5).take(MAX_PACKET_SIZE));

        let mut reader = FrameReader::new();
        let mut src = Cursor::new(bytes);
        let body = reader.read_frame(&mut src).unwrap().expect("full frame");
        assert_eq!(body.len(), MAX_PACKET_SIZE);
    }

    #[test]
    fn outbound_family_enforced() {
        let err = build_frame(0x3200_0001, &[], &DEFAULT_KEY).unwrap_err();
        assert!(matches!(err, ProtocolError::BadDirection(_)));
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = vec![0u8; MAX_PACKET_SIZE];
        let err = build_frame(SHARD_TO_CLIENT | 1, &payload, &DEFAULT_KEY).unwrap_err();
        assert!(matches!(err, ProtocolError::OversizedPacket(_)));
    }

    #[test]
    fn peer_close_is_an_error() {
        let mut reader = FrameReader::new();
        let mut src = Cursor::new(Vec::new());

        let err = reader.read_frame(&mut src).unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }
}
