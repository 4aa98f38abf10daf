//! Registration state of the backend server.

use std::{fmt::Display, time::Duration};

use parking_lot::Mutex;

/// Interval between pings until the proxy says otherwise.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
/// Interval between pings after the proxy refused the registration.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unregistered,
    /// A ping was sent, the proxy didn't answer yet.
    AwaitingAck,
    Registered,
}

/// Tracks whether the proxy knows about this server,
/// and how long to wait before the next ping.
///
/// Pings are numbered so answers and expiries of older pings
/// never undo what a newer ping established.
#[derive(Debug)]
pub struct Handshake {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: HandshakeState,
    delay: Duration,
    /// Sequence number of the last ping sent.
    sent: u64,
    /// Sequence number of the last ping the proxy answered.
    answered: u64,
    /// Whether that answer was a refusal.
    refused: bool,
}

impl Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unregistered => f.write_str("unregistered"),
            Self::AwaitingAck => f.write_str("awaiting acknowledgement"),
            Self::Registered => f.write_str("registered"),
        }
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn reset(&mut self) {
        self.state = HandshakeState::Unregistered;
        self.delay = if self.refused {
            RETRY_INTERVAL
        } else {
            DEFAULT_PING_INTERVAL
        };
    }

    /// Records an answer to ping `seq`, unless a newer ping was answered already.
    fn answer(&mut self, seq: u64, refused: bool) -> bool {
        if seq < self.answered {
            return false;
        }
        self.answered = seq;
        self.refused = refused;
        true
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: HandshakeState::Unregistered,
                delay: DEFAULT_PING_INTERVAL,
                sent: 0,
                answered: 0,
                refused: false,
            }),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.inner.lock().state
    }

    /// Time to wait before the next ping.
    pub fn delay(&self) -> Duration {
        self.inner.lock().delay
    }

    pub fn is_registered(&self) -> bool {
        self.state() == HandshakeState::Registered
    }

    /// A ping went out. Only an unregistered server waits for an acknowledgement,
    /// pings of a registered one are plain heartbeats.
    ///
    /// Returns the sequence number of the ping.
    pub fn ping_sent(&self) -> u64 {
        let mut inner = self.inner.lock();
        if inner.state == HandshakeState::Unregistered {
            inner.state = HandshakeState::AwaitingAck;
        }
        inner.sent += 1;
        inner.sent
    }

    /// The proxy accepted a ping.
    ///
    /// Returns whether the server just became registered.
    ///
    /// ## Arguments
    ///
    /// * `seq` - Sequence number of the accepted ping
    /// * `interval` - Ping interval requested by the proxy, if any
    pub fn acknowledged(&self, seq: u64, interval: Option<Duration>) -> bool {
        let mut inner = self.inner.lock();
        if !inner.answer(seq, false) {
            return false;
        }
        let registered = inner.state != HandshakeState::Registered;
        inner.state = HandshakeState::Registered;
        inner.delay = interval
            .filter(|interval| !interval.is_zero())
            .unwrap_or(DEFAULT_PING_INTERVAL);
        registered
    }

    /// The proxy refused a ping. Pings slow down until it changes its mind.
    ///
    /// ## Arguments
    ///
    /// * `seq` - Sequence number of the refused ping
    pub fn refused(&self, seq: u64) {
        let mut inner = self.inner.lock();
        if inner.answer(seq, true) {
            inner.reset();
        }
    }

    /// Ping `seq` got no answer in time.
    ///
    /// The handshake is reset unless a newer ping was answered meanwhile.
    /// Returns the state it was reset from.
    pub fn expired(&self, seq: u64) -> Option<HandshakeState> {
        let mut inner = self.inner.lock();
        if inner.answered >= seq {
            return None;
        }
        let previous = inner.state;
        inner.reset();
        Some(previous)
    }

    /// The proxy forgot about the server, or is gone.
    ///
    /// A refusal backoff in progress is kept.
    pub fn reset(&self) {
        self.inner.lock().reset();
    }
}
