//! Per-connection liveness probing.
//!
//! Heartbeats detect a dead transport; acks detect an unprocessed application
//! message. The two are independent: a connection can be heartbeat-alive
//! while having arbitrarily many timed-out acks.
//!
//! The state machine is pure and `Instant`-driven; the WebSocket session loop
//! sleeps until [`Heartbeat::deadline`] and feeds the result of
//! [`Heartbeat::fire`] back into the transport.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping probe and start waiting for a pong.
    SendPing,
    /// No pong arrived within the timeout; the connection is presumed dead
    /// and must be closed and evicted.
    Expired,
    /// Deadline fired spuriously (a pong raced it); nothing to do.
    Idle,
}

#[derive(Debug)]
pub struct Heartbeat {
    ping_interval: Duration,
    pong_timeout: Duration,
    next_ping_at: Instant,
    pong_deadline: Option<Instant>,
}

impl Heartbeat {
    pub fn new(ping_interval: Duration, pong_timeout: Duration, now: Instant) -> Self {
        Self {
            ping_interval,
            pong_timeout,
            next_ping_at: now + ping_interval,
            pong_deadline: None,
        }
    }

    /// The next instant at which [`fire`](Self::fire) should be called.
    /// While a ping is outstanding this is the pong deadline; no second ping
    /// is scheduled until the first resolves.
    pub fn deadline(&self) -> Instant {
        self.pong_deadline.unwrap_or(self.next_ping_at)
    }

    /// Advance the machine at `now`.
    pub fn fire(&mut self, now: Instant) -> HeartbeatAction {
        if let Some(deadline) = self.pong_deadline {
            if now >= deadline {
                return HeartbeatAction::Expired;
            }
            return HeartbeatAction::Idle;
        }
        if now >= self.next_ping_at {
            self.pong_deadline = Some(now + self.pong_timeout);
            return HeartbeatAction::SendPing;
        }
        HeartbeatAction::Idle
    }

    /// Any liveness response cancels the armed timeout and re-arms the next
    /// probe interval.
    pub fn on_pong(&mut self, now: Instant) {
        self.pong_deadline = None;
        self.next_ping_at = now + self.ping_interval;
    }

    pub fn awaiting_pong(&self) -> bool {
        self.pong_deadline.is_some()
    }
}
