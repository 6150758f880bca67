//! # Server Roles
//!
//! The two concrete server roles built on the reactor: the login server,
//! which authenticates clients and derives their session keys, and the
//! shard server, which hosts entered players, keeps them alive and feeds
//! the telemetry channel.
//!
//! Only the hook bodies and handler tables differ between roles; the
//! framing, dispatch and timer machinery is shared.

pub mod login;
pub mod shard;

use std::collections::HashMap;
use std::sync::Mutex;

/// Session state carried from a successful login to the shard the client
/// crosses into.
#[derive(Debug, Clone)]
pub struct Session {
    pub player_name: String,
    /// The FE-key the shard installs when the client presents the matching
    /// serial key.
    pub fe_key: u64,
}

/// Login → shard session registry.
///
/// The login role inserts one entry per successful login under a
/// serial key that travels to the client inside the login response; the
/// shard role takes the entry back out when the client presents that key
/// in its enter request. Entries are consumed exactly once.
#[derive(Default)]
pub struct SessionHandoff {
    sessions: Mutex<HashMap<u64, Session>>,
}

impl SessionHandoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, serial_key: u64, session: Session) {
        self.lock().insert(serial_key, session);
    }

    /// Consume the session for `serial_key`, if any.
    pub fn take(&self, serial_key: u64) -> Option<Session> {
        self.lock().remove(&serial_key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Session>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Decode a NUL-padded fixed-width string field.
pub fn fixed_str(raw: &[u8]) -> &str {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end]).unwrap_or("")
}

/// Encode a string into a NUL-padded fixed-width field, truncating to fit.
pub fn fixed_bytes<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let take = s.len().min(N);
    out[..take].copy_from_slice(&s.as_bytes()[..take]);
    out
}
