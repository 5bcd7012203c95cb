//! Candidate registry and selection scoring.
//!
//! Candidates are every network address the node has ever learned about.
//! They are created from `addr` gossip, bootstrap seeds, or a persisted
//! address book, and are never destroyed, only marked disabled. Selection
//! scores each candidate and picks the best one not already bound to a peer
//! slot; a uniform shuffle term breaks ties and injects diversity.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tracing::debug;

/// Standard penalty subtracted from gossiped `addr` timestamps.
pub const ADDR_TIMESTAMP_PENALTY_SECS: u64 = 2 * 60 * 60;

const SEVEN_DAYS_SECS: u64 = 7 * 24 * 60 * 60;
const ONE_DAY_SECS: u64 = 24 * 60 * 60;

/// Whether a candidate may be dialed under normal policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateStatus {
    Active,
    Disabled,
}

/// A known network address that may become a peer.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub ip: Ipv4Addr,
    pub port: u16,
    /// Service bits, refreshed from the peer's `version`.
    pub services: u64,
    /// Unix seconds the address was last seen or heard from.
    pub last_seen: u64,
    pub status: CandidateStatus,
    /// Representative latency in milliseconds; 0 means untested.
    pub avg_latency_ms: f64,
    /// Slot currently dialed into this candidate, if any.
    pub slot: Option<usize>,
}

impl Candidate {
    /// Whether a peer slot is currently bound to this candidate.
    pub fn is_peer(&self) -> bool {
        self.slot.is_some()
    }

    /// Dialable socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

/// Arena of candidates with an address index for gossip deduplication.
#[derive(Debug, Default)]
pub struct CandidateBook {
    entries: Vec<Candidate>,
    index: HashMap<(Ipv4Addr, u16), usize>,
}

impl CandidateBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> &Candidate {
        &self.entries[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Candidate {
        &mut self.entries[index]
    }

    /// Insert or refresh a candidate. An existing entry keeps the newer of
    /// the two timestamps, so re-ingesting the same gossip is a no-op.
    pub fn insert(&mut self, ip: Ipv4Addr, port: u16, services: u64, last_seen: u64) -> usize {
        if let Some(&existing) = self.index.get(&(ip, port)) {
            let entry = &mut self.entries[existing];
            entry.last_seen = entry.last_seen.max(last_seen);
            if services != 0 {
                entry.services = services;
            }
            return existing;
        }
        let index = self.entries.len();
        self.entries.push(Candidate {
            ip,
            port,
            services,
            last_seen,
            status: CandidateStatus::Active,
            avg_latency_ms: 0.0,
            slot: None,
        });
        self.index.insert((ip, port), index);
        debug!(peer = %SocketAddrV4::new(ip, port), total = self.entries.len(), "new candidate");
        index
    }

    /// Ingest one gossiped `addr` record, applying the standard two-hour
    /// timestamp penalty.
    pub fn ingest_gossip(&mut self, ip: Ipv4Addr, port: u16, services: u64, claimed_time: u64) {
        let penalized = claimed_time.saturating_sub(ADDR_TIMESTAMP_PENALTY_SECS);
        self.insert(ip, port, services, penalized);
    }

    /// Mark a candidate as undialable under normal policy.
    pub fn disable(&mut self, index: usize) {
        self.entries[index].status = CandidateStatus::Disabled;
    }

    /// Record that `slot` now dials this candidate.
    pub fn bind_slot(&mut self, index: usize, slot: usize) {
        self.entries[index].slot = Some(slot);
    }

    /// Record that no slot references this candidate anymore.
    pub fn release_slot(&mut self, index: usize) {
        self.entries[index].slot = None;
    }

    /// Deterministic part of the selection score.
    ///
    /// `status`: 0 active, -10 disabled. `timestamp`: candidates older than
    /// a week score 0.8, one-to-seven days 1.0, and fresher than a day 0.5,
    /// suppressing addresses we just used. `latency`: tolerance over the
    /// moving average when known, otherwise 1.
    pub fn score_parts(candidate: &Candidate, now_secs: u64, latency_tolerance_ms: f64) -> f64 {
        let status_score = match candidate.status {
            CandidateStatus::Active => 0.0,
            CandidateStatus::Disabled => -10.0,
        };

        let age = now_secs.saturating_sub(candidate.last_seen);
        let timestamp_score = if age > SEVEN_DAYS_SECS {
            0.8
        } else if age > ONE_DAY_SECS {
            1.0
        } else {
            0.5
        };

        let latency_score = if candidate.avg_latency_ms > 0.0 {
            latency_tolerance_ms / candidate.avg_latency_ms
        } else {
            1.0
        };

        status_score + timestamp_score + latency_score
    }

    /// Highest-scoring candidate not currently bound to a peer slot.
    ///
    /// Disabled candidates stay eligible: when nothing better is free the
    /// node keeps dialing in degraded mode rather than stalling. Returns
    /// `None` only when the registry is empty or every candidate is a peer,
    /// in which case the caller defers to the next periodic tick.
    pub fn best_non_peer(&self, now_secs: u64, latency_tolerance_ms: f64) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (index, candidate) in self.entries.iter().enumerate() {
            if candidate.is_peer() {
                continue;
            }
            let shuffle = rand::random::<f64>() * 2.0;
            let score = Self::score_parts(candidate, now_secs, latency_tolerance_ms) + shuffle;
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((index, score));
            }
        }
        best.map(|(index, _)| index)
    }
}
