//! Per-slot peer state.
//!
//! The engine owns a fixed array of slots. A slot cycles through
//! `Empty -> Dialing -> Handshaking -> Ready -> Closing` and back around via
//! replacement; its generation counter is bumped on every fresh dial so that
//! late events from a recycled connection can be detected and dropped.

use btc_wire::{BlockHash, Command};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;

/// Number of samples in the latency ring. A peer whose ring is full is
/// "fully tested" and its mean becomes the representative latency.
pub const LATENCY_SAMPLES: usize = 8;

/// Lifecycle state of a peer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No candidate bound; waiting for the registry to offer one.
    Empty,
    /// TCP connect in flight.
    Dialing,
    /// Connected, exchanging `version`/`verack`.
    Handshaking,
    /// Hand-shaken in both directions.
    Ready,
    /// Socket torn down or being torn down; awaiting replacement.
    Closing,
}

/// Handshake progress, one boolean per direction.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeState {
    /// They sent us a `verack`.
    pub they_accepted_us: bool,
    /// Their `version` met our minimum.
    pub we_accept_them: bool,
    /// Stamped at dial, restamped when our `version` hits the wire.
    pub started_at: Instant,
}

impl HandshakeState {
    fn new(now: Instant) -> Self {
        Self {
            they_accepted_us: false,
            we_accept_them: false,
            started_at: now,
        }
    }

    /// Hand-shaken in both directions.
    pub fn complete(&self) -> bool {
        self.they_accepted_us && self.we_accept_them
    }
}

/// Ping/latency bookkeeping.
#[derive(Debug, Clone)]
pub struct PingState {
    /// Nonce of the last ping we sent.
    pub nonce: u64,
    /// When the last ping hit the wire (write completion, not enqueue).
    pub sent_at: Option<Instant>,
    /// When the matching pong arrived.
    pub pong_at: Option<Instant>,
    samples: [f64; LATENCY_SAMPLES],
    filled: usize,
    cursor: usize,
}

impl PingState {
    fn new() -> Self {
        Self {
            nonce: 0,
            sent_at: None,
            pong_at: None,
            samples: [0.0; LATENCY_SAMPLES],
            filled: 0,
            cursor: 0,
        }
    }

    /// Push a latency sample in milliseconds into the ring.
    pub fn record(&mut self, latency_ms: f64) {
        self.samples[self.cursor] = latency_ms;
        self.cursor = (self.cursor + 1) % LATENCY_SAMPLES;
        self.filled = (self.filled + 1).min(LATENCY_SAMPLES);
    }

    /// The ring is full.
    pub fn fully_tested(&self) -> bool {
        self.filled == LATENCY_SAMPLES
    }

    /// Mean of the recorded samples, if any.
    pub fn average(&self) -> Option<f64> {
        if self.filled == 0 {
            return None;
        }
        Some(self.samples[..self.filled].iter().sum::<f64>() / self.filled as f64)
    }
}

/// An encoded message queued for a peer, tagged with its command so the
/// write-completion hook can stamp timestamps.
#[derive(Debug)]
pub struct OutboundFrame {
    pub command: Command,
    pub bytes: Bytes,
}

/// One entry of the peer table.
#[derive(Debug)]
pub struct PeerSlot {
    /// Position in the table.
    pub index: usize,
    /// Bumped on every fresh dial; stale connection events are dropped.
    pub generation: u64,
    pub state: SlotState,
    /// Back-reference into the candidate registry.
    pub candidate: Option<usize>,
    /// Dialed address.
    pub addr: Option<SocketAddr>,
    /// When this connection attempt started.
    pub connected_at: Instant,
    pub handshake: HandshakeState,
    pub ping: PingState,
    /// Last time any frame arrived.
    pub last_heard: Instant,
    /// Outstanding block request, at most one at a time.
    pub requesting: Option<BlockHash>,
    /// Chain height the peer advertised in `version`.
    pub peer_height: i32,
    /// Protocol version the peer advertised.
    pub peer_version: i32,
    /// Service bits the peer advertised.
    pub peer_services: u64,
    /// Queue into the connection task; `None` once the socket is gone.
    pub outbound: Option<mpsc::Sender<OutboundFrame>>,
    /// A deliberate close is in flight and its completion event is pending.
    pub close_pending: bool,
}

impl PeerSlot {
    /// A fresh, empty slot.
    pub fn new(index: usize) -> Self {
        let now = Instant::now();
        Self {
            index,
            generation: 0,
            state: SlotState::Empty,
            candidate: None,
            addr: None,
            connected_at: now,
            handshake: HandshakeState::new(now),
            ping: PingState::new(),
            last_heard: now,
            requesting: None,
            peer_height: 0,
            peer_version: 0,
            peer_services: 0,
            outbound: None,
            close_pending: false,
        }
    }

    /// Reset all connection state for a fresh dial of `candidate`.
    pub fn reset_for_dial(&mut self, candidate: usize, addr: SocketAddr) {
        let now = Instant::now();
        self.generation += 1;
        self.state = SlotState::Dialing;
        self.candidate = Some(candidate);
        self.addr = Some(addr);
        self.connected_at = now;
        self.handshake = HandshakeState::new(now);
        self.ping = PingState::new();
        self.last_heard = now;
        self.requesting = None;
        self.peer_height = 0;
        self.peer_version = 0;
        self.peer_services = 0;
        self.outbound = None;
        self.close_pending = false;
    }

    /// Hand-shaken and connected.
    pub fn is_ready(&self) -> bool {
        self.state == SlotState::Ready
    }

    /// Ready with no outstanding block request.
    pub fn is_idle(&self) -> bool {
        self.is_ready() && self.requesting.is_none()
    }

    /// Advertised height clamped to a chain height.
    pub fn advertised_height(&self) -> u32 {
        self.peer_height.max(0) as u32
    }
}
