//! # Telemetry Side-Channel
//!
//! A plain ASCII-line push server multiplexed on the game reactor.
//!
//! Operators (or dashboards) connect to the monitor port and receive one
//! frame per tick:
//!
//! ```text
//! begin
//! player <x> <y> <name>     (one per visible player)
//! chat <message>            (one per accumulated chat record)
//! email <first line>
//! <tab-indented body lines>
//! endemail
//! end
//! ```
//!
//! Email bodies have every interior newline followed by a tab so a hostile
//! message cannot spoof the `endemail` terminator. Chat and email buffers
//! are drained after each tick.
//!
//! The subscriber list and the accumulation buffers share one mutex — the
//! only lock in the runtime — because collectors may feed them from outside
//! the reactor thread while the accept path and the tick run on it.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Mutex;

use mio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Fixed line-buffer size. The longest protocol line is an email whose
/// body can double in the pathological all-newlines case; this bound
/// contains it with room to spare.
pub const LINE_BUFFER_SIZE: usize = 2048;

#[derive(Default)]
struct Shared {
    subscribers: Vec<TcpStream>,
    chats: Vec<String>,
    emails: Vec<String>,
}

/// The telemetry listener plus its shared subscriber and record state.
pub struct Monitor {
    listener: TcpListener,
    shared: Mutex<Shared>,
}

impl Monitor {
    /// Bind the monitor listener on the given address.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!(addr = %addr, "monitor listening");

        Ok(Self {
            listener,
            shared: Mutex::new(Shared::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The listener source, for registration with the reactor poll.
    pub fn listener_mut(&mut self) -> &mut TcpListener {
        &mut self.listener
    }

    /// Accept every pending subscriber. Called from the role's
    /// extra-socket hook when the monitor token turns readable.
    pub fn accept_pending(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "new monitor connection");
                    self.lock().subscribers.push(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "monitor accept failed");
                    break;
                }
            }
        }
    }

    /// Queue a chat record for the next tick. Callable from any thread.
    pub fn push_chat(&self, message: impl Into<String>) {
        self.lock().chats.push(message.into());
    }

    /// Queue an email record for the next tick. Callable from any thread.
    pub fn push_email(&self, email: impl Into<String>) {
        self.lock().emails.push(email.into());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Push one telemetry frame to every subscriber and drain the chat and
    /// email buffers. `players` carries `(x, y, name)` for each visible
    /// player.
    pub fn tick(&self, players: &[(i32, i32, &str)]) {
        let mut shared = self.lock();

        if shared.subscribers.is_empty() {
            shared.chats.clear();
            shared.emails.clear();
            return;
        }

        let mut lines: Vec<Vec<u8>> = Vec::new();
        lines.push(b"begin\n".to_vec());

        for (x, y, name) in players {
            lines.push(format!("player {x} {y} {name}\n").into_bytes());
        }

        for chat in &shared.chats {
            lines.push(format!("chat {chat}\n").into_bytes());
        }

        for email in &shared.emails {
            lines.push(format_email(email));
            lines.push(b"endemail\n".to_vec());
        }

        lines.push(b"end\n".to_vec());

        // A send failure drops that subscriber and moves on to the next;
        // the remaining lines of its frame are abandoned with it.
        let mut i = 0;
        'subscribers: while i < shared.subscribers.len() {
            for line in &lines {
                if !transmit(&mut shared.subscribers[i], line) {
                    shared.subscribers.remove(i);
                    info!("disconnected a monitor");
                    continue 'subscribers;
                }
            }
            i += 1;
        }

        shared.chats.clear();
        shared.emails.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Write the whole buffer, treating any error (including would-block on a
/// stalled subscriber) as a dead subscriber.
fn transmit(stream: &mut TcpStream, mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => return false,
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "monitor send failed");
                return false;
            }
        }
    }
    true
}

/// Render one email record: `email ` prefix, body with every interior
/// newline followed by a tab, capped at the fixed line buffer.
fn format_email(email: &str) -> Vec<u8> {
    let mut line = Vec::with_capacity(LINE_BUFFER_SIZE);
    line.extend_from_slice(b"email ");

    for c in email.bytes() {
        if line.len() >= LINE_BUFFER_SIZE - 2 {
            break;
        }

        line.push(c);

        // indent continuation lines so "endemail" cannot be spoofed
        if c == b'\n' {
            line.push(b'\t');
        }
    }

    line.push(b'\n');
    line
}
