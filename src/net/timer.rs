//! # Timers
//!
//! Periodic events fired from the reactor tick.
//!
//! Each timer holds a delta interval and its next-fire timestamp. The
//! timestamp starts at the zero sentinel and is armed to `now + delta` the
//! first time the tick observes it, so registration order never causes an
//! immediate burst at startup. A timer fires at most once per tick even
//! when overdue by several intervals, and reschedules from the current
//! time rather than its nominal slot; drift by handler execution time is
//! accepted at the cadences used here.

use crate::net::connection::ConnectionTable;

/// A timer callback: runs on the reactor thread with the role state and
/// the full connection table.
pub type TimerHandler<R> = Box<dyn FnMut(&mut R, &mut ConnectionTable, u64)>;

struct TimerEvent<R> {
    handler: TimerHandler<R>,
    delta_ms: u64,
    /// Zero until first observed by a tick.
    next_fire_ms: u64,
}

/// The flat sequence of periodic events owned by a reactor. Registered
/// once at construction; fired in registration order after each tick's
/// I/O.
pub struct TimerSet<R> {
    timers: Vec<TimerEvent<R>>,
}

impl<R> Default for TimerSet<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> TimerSet<R> {
    pub fn new() -> Self {
        Self { timers: Vec::new() }
    }

    /// Register a periodic handler with the given interval.
    pub fn register<F>(&mut self, delta_ms: u64, handler: F)
    where
        F: FnMut(&mut R, &mut ConnectionTable, u64) + 'static,
    {
        self.timers.push(TimerEvent {
            handler: Box::new(handler),
            delta_ms,
            next_fire_ms: 0,
        });
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Arm unobserved timers and invoke every due handler once.
    pub fn fire_due(&mut self, role: &mut R, conns: &mut ConnectionTable, now_ms: u64) {
        for event in &mut self.timers {
            if event.next_fire_ms == 0 {
                // first observation: queue it, don't fire
                event.next_fire_ms = now_ms + event.delta_ms;
                continue;
            }

            if event.next_fire_ms < now_ms {
                (event.handler)(role, conns, now_ms);
                event.next_fire_ms = now_ms + event.delta_ms;
            }
        }
    }
}
