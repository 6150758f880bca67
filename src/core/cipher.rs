//! # Wire Cipher
//!
//! XOR + byte-swap transform and key derivation for the client protocol.
//!
//! The scheme is symmetric and offers negligible security; what matters is
//! bit-exact compatibility with the existing client. Both transforms operate
//! in place and are their own inverse:
//!
//! - **XOR**: every byte is XORed with `key[i % 8]`.
//! - **Byte swap**: the buffer is partitioned into blocks of `er_size`
//!   bytes and each complete block is reversed; trailing bytes that do not
//!   fill a block are left untouched.
//!
//! Encryption applies the byte swap first and the XOR second; decryption
//! undoes them in the opposite order.

/// The well-known bootstrap key. Every connection starts out encrypting
/// with this key until the login handshake derives a per-session key.
pub const DEFAULT_KEY: [u8; 8] = *b"m@rQn~W#";

/// Key length in bytes; also the block size used by the byte-swap pass.
pub const KEY_LENGTH: usize = 8;

/// XOR `buf` against the repeating 8-byte `key`. Self-inverse.
pub fn xor_transform(buf: &mut [u8], key: &[u8; KEY_LENGTH]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b ^= key[i % KEY_LENGTH];
    }
}

/// Reverse the byte order of every complete `er_size` block of `buf`.
/// Trailing bytes that do not fill a block are untouched. Self-inverse.
///
/// `er_size` must be positive; a zero block size would not partition the
/// buffer at all, so it is rejected by debug assertion and treated as a
/// no-op in release builds.
pub fn byte_swap(buf: &mut [u8], er_size: usize) {
    debug_assert!(er_size > 0, "block size must be positive");
    if er_size == 0 {
        return;
    }

    for block in buf.chunks_exact_mut(er_size) {
        block.reverse();
    }
}

/// Encrypt `buf` in place: byte swap, then XOR with `key`.
pub fn encrypt(buf: &mut [u8], key: &[u8; KEY_LENGTH]) {
    byte_swap(buf, KEY_LENGTH);
    xor_transform(buf, key);
}

/// Decrypt `buf` in place: XOR with `key`, then byte swap.
pub fn decrypt(buf: &mut [u8], key: &[u8; KEY_LENGTH]) {
    xor_transform(buf, key);
    byte_swap(buf, KEY_LENGTH);
}

/// The default key interpreted as a little-endian 64-bit integer; the
/// starting point for key derivation and the initial E-key of every
/// connection.
pub fn default_key_u64() -> u64 {
    u64::from_le_bytes(DEFAULT_KEY)
}

/// Derive the rotated session key from the handshake parameters.
///
/// `u_time` is the server uptime value echoed in the login response and
/// `iv1`/`iv2` are the two initialization integers from the same packet.
/// Two composed steps: the default key's 64-bit little-endian value is
/// multiplied by the running product form `iv1 + 1`, and the result is
/// XORed against material derived from `u_time` and `iv2 + 1`. All
/// arithmetic wraps, and the IVs are sign-extended first, matching the
/// client's integer conversions.
pub fn derive_key(u_time: u64, iv1: i32, iv2: i32) -> u64 {
    let num1 = i64::from(iv1.wrapping_add(1)) as u64;
    let num2 = i64::from(iv2.wrapping_add(1)) as u64;

    default_key_u64().wrapping_mul(num1) ^ u_time.wrapping_mul(num2)
}

/// Expand a 64-bit key into the byte form consumed by the transforms.
pub fn key_bytes(key: u64) -> [u8; KEY_LENGTH] {
    key.to_le_bytes()
}
