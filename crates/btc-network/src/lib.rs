//! # btc-network
//!
//! Outbound P2P engine for a Bitcoin-protocol node.
//!
//! This crate provides:
//! - A fixed fleet of outbound peer slots with handshake and ping state
//! - A candidate registry with scoring-based peer selection
//! - Timer-driven sync orchestration against a pluggable chain store
//! - A single-purpose admin listener for orderly shutdown
//!
//! Everything mutable lives inside one engine task: connection tasks only
//! shovel bytes and report events over channels, so no locks guard the peer
//! table, the candidate registry, or the chain store.

pub mod admin;
mod candidates;
pub mod chain;
mod conn;
mod engine;
mod error;
mod peer;
mod scheduler;

pub use candidates::{Candidate, CandidateBook, CandidateStatus, ADDR_TIMESTAMP_PENALTY_SECS};
pub use chain::{BlockStatus, ChainStore, HeaderStatus, MemoryChain};
pub use conn::{CloseReason, EngineEvent, SlotEvent};
pub use engine::{Engine, EngineConfig, Tolerances};
pub use error::{NetworkError, NetworkResult};
pub use peer::{HandshakeState, OutboundFrame, PeerSlot, PingState, SlotState, LATENCY_SAMPLES};
pub use scheduler::{Periods, Scheduler, Task};

/// Default admin (operation) port.
pub const DEFAULT_OPERATION_PORT: u16 = 9494;

/// Bound on queued outbound frames per peer.
pub const OUTBOUND_QUEUE: usize = 64;
