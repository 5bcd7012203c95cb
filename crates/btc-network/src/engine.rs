//! The engine: one task owning the peer table, candidate registry, chain
//! store handle, and timer table.
//!
//! Connection tasks and the admin listener communicate with it exclusively
//! over channels, and every handler below is a synchronous function, so each
//! inbound message and each timer tick runs to completion against a
//! consistent snapshot of the node's state. Replacing a peer is the
//! universal cancellation primitive: it closes the socket and dials a fresh
//! candidate into the same slot once the close has completed.

use crate::admin;
use crate::candidates::CandidateBook;
use crate::chain::{ChainStore, HeaderStatus};
use crate::conn::{self, CloseReason, EngineEvent, SlotEvent};
use crate::error::NetworkResult;
use crate::peer::{OutboundFrame, PeerSlot, SlotState};
use crate::scheduler::{Periods, Scheduler, Task};
use crate::OUTBOUND_QUEUE;
use btc_wire::{
    display_hash, encode_message, BlockLocator, Command, InventoryItem, Message, NetworkAddress,
    NetworkParams, RawFrame, TimestampedAddress, VersionMessage, WireError, MAINNET, MSG_BLOCK,
    ZERO_HASH,
};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Liveness thresholds in milliseconds.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Tolerances {
    /// Replace a peer that has not hand-shaken within this long.
    pub handshake: u64,
    /// Log peers whose fully-tested average latency exceeds this.
    pub latency: u64,
    /// Replace peers older than this; zero disables the check.
    pub peer_life: u64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            handshake: 10_000,
            latency: 2_000,
            peer_life: 0,
        }
    }
}

/// Everything the engine needs to run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Static parameters of the dialed network.
    pub params: NetworkParams,
    /// Protocol version advertised in our `version`.
    pub protocol_version: i32,
    /// Service bits advertised in our `version`.
    pub services: u64,
    /// User agent advertised in our `version`.
    pub user_agent: String,
    /// Peer slots outside initial block download.
    pub max_outgoing: usize,
    /// Peer slots during initial block download.
    pub max_outgoing_ibd: usize,
    /// Send `getaddr` after a handshake while the registry is smaller.
    pub getaddr_threshold: usize,
    /// IBD switches off once full-block availability exceeds this ratio.
    pub ibd_availability_threshold: f64,
    pub tolerances: Tolerances,
    pub periods: Periods,
    /// Admin listener port.
    pub operation_port: u16,
    /// Admin listener backlog.
    pub backlog: u32,
    /// Commands whose inbound logging is suppressed.
    pub silent_commands: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            params: MAINNET,
            protocol_version: 70015,
            services: btc_wire::SERVICE_NODE_NETWORK,
            user_agent: "/btc-node:0.1.0/".to_string(),
            max_outgoing: 8,
            max_outgoing_ibd: 64,
            getaddr_threshold: 1000,
            ibd_availability_threshold: 0.95,
            tolerances: Tolerances::default(),
            periods: Periods::default(),
            operation_port: crate::DEFAULT_OPERATION_PORT,
            backlog: 32,
            silent_commands: vec!["ping".to_string(), "pong".to_string()],
        }
    }
}

fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// IBD is active while the contiguous-block ratio is at or below the
/// availability threshold. An empty chain is always in IBD.
fn ibd_active(max_full: u32, tip_height: u32, threshold: f64) -> bool {
    if tip_height == 0 {
        return true;
    }
    (max_full as f64 / tip_height as f64) <= threshold
}

/// The P2P engine. Owns all mutable networking state; see the module docs.
pub struct Engine<C: ChainStore> {
    config: EngineConfig,
    chain: C,
    slots: Vec<PeerSlot>,
    candidates: CandidateBook,
    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: Option<mpsc::Receiver<EngineEvent>>,
    kill_tx: mpsc::Sender<()>,
    kill_rx: Option<mpsc::Receiver<()>>,
    ibd_mode: bool,
    unknown_commands: u64,
}

impl<C: ChainStore> Engine<C> {
    /// Build an engine over `chain`, seeding the candidate registry with
    /// the bootstrap addresses.
    pub fn new(
        config: EngineConfig,
        chain: C,
        bootstrap: Vec<(std::net::Ipv4Addr, u16)>,
    ) -> Self {
        let mut candidates = CandidateBook::new();
        let now = unix_time_secs();
        for (ip, port) in bootstrap {
            candidates.insert(ip, port, 0, now);
        }

        let (_, tip_height) = chain.tip();
        let ibd_mode = ibd_active(
            chain.max_full_block_height(),
            tip_height,
            config.ibd_availability_threshold,
        );
        // The slot count is fixed for the life of the process; later IBD
        // flips only change post-handshake peer acceptance.
        let slot_count = if ibd_mode {
            config.max_outgoing_ibd
        } else {
            config.max_outgoing
        };

        let (events_tx, events_rx) = mpsc::channel(1024);
        let (kill_tx, kill_rx) = mpsc::channel(1);

        Self {
            config,
            chain,
            slots: (0..slot_count).map(PeerSlot::new).collect(),
            candidates,
            events_tx,
            events_rx: Some(events_rx),
            kill_tx,
            kill_rx: Some(kill_rx),
            ibd_mode,
            unknown_commands: 0,
        }
    }

    /// Run until the admin `KILL` or the autoexit timer stops the loop.
    pub async fn run(mut self) -> NetworkResult<()> {
        let listener = admin::bind(self.config.operation_port, self.config.backlog)?;
        tokio::spawn(admin::serve(listener, self.kill_tx.clone()));

        self.connect_initial_peers();

        let mut scheduler = Scheduler::new(&self.config.periods);
        let mut events_rx = self.events_rx.take().unwrap();
        let mut kill_rx = self.kill_rx.take().unwrap();

        loop {
            tokio::select! {
                Some(event) = events_rx.recv() => self.handle_event(event),
                task = scheduler.next() => {
                    if self.handle_task(task) {
                        break;
                    }
                }
                Some(()) = kill_rx.recv() => {
                    info!("stopping main loop");
                    break;
                }
            }
        }

        info!("main loop stopped");
        Ok(())
    }

    fn connect_initial_peers(&mut self) {
        info!(
            slots = self.slots.len(),
            candidates = self.candidates.len(),
            ibd = self.ibd_mode,
            "connecting initial peers"
        );
        for slot in 0..self.slots.len() {
            self.dial_next_candidate(slot);
        }
    }

    // ---- connection management -------------------------------------------

    /// Pick the best free candidate and dial it into `slot`. With the
    /// registry exhausted the slot is parked and the connectivity sweep
    /// retries on its next tick.
    fn dial_next_candidate(&mut self, slot: usize) {
        if let Some(old) = self.slots[slot].candidate.take() {
            self.candidates.release_slot(old);
        }
        let choice = self.candidates.best_non_peer(
            unix_time_secs(),
            self.config.tolerances.latency as f64,
        );
        let Some(candidate) = choice else {
            debug!(slot, "no candidate available, deferring dial");
            self.slots[slot].state = SlotState::Empty;
            self.slots[slot].outbound = None;
            return;
        };
        self.dial_into_slot(slot, candidate);
    }

    fn dial_into_slot(&mut self, slot: usize, candidate: usize) {
        let addr = self.candidates.get(candidate).socket_addr();
        info!(slot, peer = %addr, "dialing candidate");

        self.slots[slot].reset_for_dial(candidate, addr);
        self.candidates.bind_slot(candidate, slot);

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        self.slots[slot].outbound = Some(tx);
        tokio::spawn(conn::run_connection(
            slot,
            self.slots[slot].generation,
            addr,
            self.config.params.magic,
            self.events_tx.clone(),
            rx,
        ));
    }

    /// Close a peer's socket and schedule a fresh dial into the same slot.
    /// Idempotent against slots that are already closing; the actual
    /// replacement happens when the close completion event arrives, so a
    /// slot can never be double-allocated.
    fn replace_peer(&mut self, slot: usize) {
        let s = &mut self.slots[slot];
        match s.state {
            SlotState::Closing => {
                debug!(slot, "replace requested but slot is already closing");
                return;
            }
            SlotState::Empty => {
                self.dial_next_candidate(slot);
                return;
            }
            _ => {}
        }
        let life = s.connected_at.elapsed().as_secs_f64();
        info!(slot, life_secs = format_args!("{life:.1}"), "replacing peer");
        s.state = SlotState::Closing;
        s.close_pending = true;
        // Dropping the queue tells the connection task to shut the socket.
        s.outbound = None;
    }

    // ---- event handling ---------------------------------------------------

    fn handle_event(&mut self, event: EngineEvent) {
        let EngineEvent {
            slot,
            generation,
            event,
        } = event;
        if slot >= self.slots.len() || self.slots[slot].generation != generation {
            debug!(slot, "dropping event for recycled slot");
            return;
        }
        match event {
            SlotEvent::Connected => self.on_connected(slot),
            SlotEvent::ConnectFailed { error } => self.on_connect_failed(slot, &error),
            SlotEvent::Frame { frame } => self.on_frame(slot, frame),
            SlotEvent::Wrote { command } => self.on_wrote(slot, command),
            SlotEvent::WriteFailed { command, error } => {
                warn!(slot, command = %command, error = %error, "failed to send message");
            }
            SlotEvent::Closed { reason } => self.on_closed(slot, reason),
        }
    }

    fn on_connected(&mut self, slot: usize) {
        self.slots[slot].state = SlotState::Handshaking;
        let version = self.our_version(slot);
        self.send_message(slot, &Message::Version(version));
    }

    fn on_connect_failed(&mut self, slot: usize, error: &str) {
        warn!(slot, error, "connection failed");
        if let Some(candidate) = self.slots[slot].candidate {
            self.candidates.disable(candidate);
        }
        self.dial_next_candidate(slot);
    }

    fn on_closed(&mut self, slot: usize, reason: CloseReason) {
        match reason {
            // Deliberate replacement or a hard read error: the close has
            // completed, re-dial now.
            CloseReason::Replaced | CloseReason::ReadError => {
                self.slots[slot].close_pending = false;
                self.dial_next_candidate(slot);
            }
            // Silent EOF: park the slot, the next sweep replaces it.
            CloseReason::Eof => {
                let s = &mut self.slots[slot];
                s.state = SlotState::Closing;
                s.close_pending = false;
                s.outbound = None;
            }
        }
    }

    fn on_wrote(&mut self, slot: usize, command: Command) {
        debug!(slot, command = %command, "message sent");
        let now = Instant::now();
        match command {
            // Latency measures wire time, so the clock starts on write
            // completion rather than enqueue.
            Command::Ping => self.slots[slot].ping.sent_at = Some(now),
            Command::Version => self.slots[slot].handshake.started_at = now,
            _ => {}
        }
    }

    fn on_frame(&mut self, slot: usize, frame: RawFrame) {
        self.slots[slot].last_heard = Instant::now();

        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(WireError::UnknownCommand(name)) => {
                self.unknown_commands += 1;
                debug!(slot, command = %name, total = self.unknown_commands, "unknown command dropped");
                return;
            }
            Err(e) => {
                warn!(slot, command = %frame.command, error = %e, "dropping undecodable frame");
                return;
            }
        };

        // Only a frame that dispatched as a recognized message vouches for
        // the candidate; undecodable ones do not refresh it.
        if let Some(candidate) = self.slots[slot].candidate {
            self.candidates.get_mut(candidate).last_seen = unix_time_secs();
        }

        if !self.is_silent(frame.command) {
            info!(slot, command = %frame.command, "received message");
        }

        match message {
            Message::Version(version) => self.on_version(slot, version),
            Message::Verack => self.on_verack(slot),
            Message::Ping(nonce) => self.send_message(slot, &Message::Pong(nonce)),
            Message::Pong(nonce) => self.on_pong(slot, nonce),
            Message::Addr(records) => self.on_addr(slot, records),
            Message::Headers(headers) => self.on_headers(slot, headers),
            Message::Block(block) => self.on_block(slot, block),
            // Announcements are not chased yet; missing blocks are pulled
            // from the chain store instead.
            Message::Inv(_) => {}
            Message::Reject(reject) => {
                warn!(
                    slot,
                    message = %reject.message,
                    code = reject.code,
                    reason = %reject.reason,
                    "peer rejected our message"
                );
            }
            // This node only dials out and serves nothing.
            Message::GetAddr
            | Message::GetData(_)
            | Message::GetHeaders(_)
            | Message::GetBlocks(_)
            | Message::SendHeaders => {
                debug!(slot, command = %frame.command, "peer request ignored");
            }
        }
    }

    fn is_silent(&self, command: Command) -> bool {
        self.config
            .silent_commands
            .iter()
            .any(|name| name == command.name())
    }

    // ---- peer state machine ----------------------------------------------

    fn on_version(&mut self, slot: usize, version: VersionMessage) {
        let minimal = self.config.params.minimal_peer_version;
        let s = &mut self.slots[slot];
        s.peer_version = version.version;
        s.peer_services = version.services;
        s.peer_height = version.start_height;
        if version.version >= minimal {
            s.handshake.we_accept_them = true;
        } else {
            warn!(
                slot,
                version = version.version,
                minimal,
                "peer protocol version below minimum"
            );
        }
        if let Some(candidate) = s.candidate {
            self.candidates.get_mut(candidate).services = version.services;
        }
        self.try_finish_handshake(slot);
    }

    fn on_verack(&mut self, slot: usize) {
        self.slots[slot].handshake.they_accepted_us = true;
        self.send_message(slot, &Message::Verack);
        self.try_finish_handshake(slot);
    }

    fn try_finish_handshake(&mut self, slot: usize) {
        let s = &mut self.slots[slot];
        if !s.handshake.complete() || s.state == SlotState::Ready {
            return;
        }
        s.state = SlotState::Ready;
        info!(
            slot,
            peer = %s.addr.map(|a| a.to_string()).unwrap_or_default(),
            version = s.peer_version,
            height = s.peer_height,
            "handshake complete"
        );
        self.post_handshake(slot);
    }

    /// Runs once per connection when both handshake directions are done.
    fn post_handshake(&mut self, slot: usize) {
        if self.ibd_mode {
            let max_full = self.chain.max_full_block_height();
            if self.slots[slot].advertised_height() < max_full {
                info!(slot, "replacing peer short on blocks");
                self.replace_peer(slot);
                return;
            }
        }
        if self.candidates.len() < self.config.getaddr_threshold {
            self.send_message(slot, &Message::GetAddr);
        }
        self.ping_peer(slot);
    }

    fn ping_peer(&mut self, slot: usize) {
        let s = &mut self.slots[slot];
        if let (Some(sent), None) = (s.ping.sent_at, s.ping.pong_at) {
            // The previous ping went unanswered; account for it so a stuck
            // peer's candidate score decays instead of the ping queueing up.
            let elapsed_ms = sent.elapsed().as_secs_f64() * 1000.0;
            warn!(slot, elapsed_ms = format_args!("{elapsed_ms:.1}"), "unanswered ping");
            s.ping.record(elapsed_ms);
        }
        let nonce = rand::random::<u64>();
        s.ping.nonce = nonce;
        s.ping.pong_at = None;
        // ping.sent_at is stamped by the write-completion hook.
        self.send_message(slot, &Message::Ping(nonce));
    }

    fn on_pong(&mut self, slot: usize, nonce: u64) {
        let now = Instant::now();
        let s = &mut self.slots[slot];
        if nonce != s.ping.nonce {
            info!(
                slot,
                received = nonce,
                expected = s.ping.nonce,
                "unexpected pong nonce"
            );
            return;
        }
        let Some(sent) = s.ping.sent_at else {
            return;
        };
        s.ping.pong_at = Some(now);
        let latency_ms = now.duration_since(sent).as_secs_f64() * 1000.0;
        s.ping.record(latency_ms);
        if s.ping.fully_tested() {
            let average = s.ping.average().unwrap_or(0.0);
            if let Some(candidate) = s.candidate {
                self.candidates.get_mut(candidate).avg_latency_ms = average;
            }
        }
    }

    fn on_addr(&mut self, slot: usize, records: Vec<TimestampedAddress>) {
        let mut skipped = 0u64;
        let mut total = 0u64;
        for record in &records {
            match record.addr.as_ipv4() {
                Some(ip) => {
                    self.candidates.ingest_gossip(
                        ip,
                        record.addr.port,
                        record.addr.services,
                        record.time as u64,
                    );
                    total += 1;
                }
                None => skipped += 1,
            }
        }
        debug!(
            slot,
            ingested = total,
            skipped,
            candidates = self.candidates.len(),
            "processed addr gossip"
        );
    }

    fn on_headers(&mut self, slot: usize, headers: Vec<btc_wire::BlockHeader>) {
        let count = headers.len();
        for header in &headers {
            match self.chain.submit_header(header) {
                HeaderStatus::New | HeaderStatus::Existed => {}
                status => {
                    info!(
                        slot,
                        header = %display_hash(&header.hash()),
                        ?status,
                        "header not accepted"
                    );
                }
            }
        }
        debug!(slot, count, "processed headers");
    }

    fn on_block(&mut self, slot: usize, block: btc_wire::Block) {
        let hash = block.hash();
        let status = self.chain.submit_block(&block);
        debug!(slot, block = %display_hash(&hash), ?status, "processed block");
        self.slots[slot].requesting = None;
    }

    // ---- outbound ---------------------------------------------------------

    fn our_version(&self, slot: usize) -> VersionMessage {
        let candidate = self.slots[slot].candidate.map(|c| self.candidates.get(c));
        let addr_recv = candidate
            .map(|c| NetworkAddress::ipv4(c.ip, c.port, c.services))
            .unwrap_or_else(NetworkAddress::zero);
        VersionMessage {
            version: self.config.protocol_version,
            services: self.config.services,
            timestamp: unix_time_secs() as i64,
            addr_recv,
            addr_from: NetworkAddress::zero(),
            nonce: rand::random(),
            user_agent: self.config.user_agent.clone(),
            start_height: self.chain.tip().1 as i32,
            relay: false,
        }
    }

    /// Queue a message for a peer. Writes are fire-and-forget: a full or
    /// closed queue is logged and the liveness sweep deals with the peer.
    fn send_message(&mut self, slot: usize, message: &Message) {
        let command = message.command();
        let Some(tx) = self.slots[slot].outbound.as_ref() else {
            debug!(slot, command = %command, "no socket to send on");
            return;
        };
        let bytes = encode_message(self.config.params.magic, message);
        if tx.try_send(OutboundFrame { command, bytes }).is_err() {
            warn!(slot, command = %command, "outbound queue unavailable, message dropped");
        }
    }

    // ---- periodic tasks ---------------------------------------------------

    /// Returns `true` when the loop should stop.
    fn handle_task(&mut self, task: Task) -> bool {
        match task {
            Task::PingPeers => self.ping_peers(),
            Task::CheckConnectivity => self.check_peers_connectivity(),
            Task::ExchangeData => self.exchange_data_with_peers(),
            Task::ResetIbdMode => self.reset_ibd_mode(),
            Task::PrintStatus => self.print_node_status(),
            Task::SaveChainData => self.chain.save(),
            Task::Autoexit => {
                info!("autoexit timer fired, stopping main loop");
                return true;
            }
        }
        false
    }

    fn ping_peers(&mut self) {
        for slot in 0..self.slots.len() {
            if self.slots[slot].is_ready() {
                self.ping_peer(slot);
            }
        }
    }

    fn check_peers_connectivity(&mut self) {
        let handshake_ms = self.config.tolerances.handshake;
        let latency_ms = self.config.tolerances.latency as f64;
        let peer_life_ms = self.config.tolerances.peer_life;

        for slot in 0..self.slots.len() {
            match self.slots[slot].state {
                SlotState::Empty => {
                    // A dial deferred on an exhausted registry; retry.
                    self.dial_next_candidate(slot);
                    continue;
                }
                SlotState::Closing => {
                    if !self.slots[slot].close_pending {
                        // A silently closed socket; replace now.
                        self.dial_next_candidate(slot);
                    }
                    continue;
                }
                _ => {}
            }

            let s = &self.slots[slot];
            let elapsed_ms = s.handshake.started_at.elapsed().as_millis() as u64;
            if !s.is_ready() && elapsed_ms > handshake_ms {
                warn!(slot, elapsed_ms, "no handshake in time");
                if let Some(candidate) = s.candidate {
                    self.candidates.disable(candidate);
                }
                self.replace_peer(slot);
                continue;
            }

            if peer_life_ms > 0 && s.connected_at.elapsed().as_millis() as u64 > peer_life_ms {
                info!(slot, "peer life exhausted");
                self.replace_peer(slot);
                continue;
            }

            if s.ping.fully_tested() {
                if let Some(average) = s.ping.average() {
                    if average > latency_ms {
                        // Policy for now: observe, do not act.
                        warn!(
                            slot,
                            average_ms = format_args!("{average:.1}"),
                            "average latency above tolerance"
                        );
                    }
                }
            }
        }
    }

    fn exchange_data_with_peers(&mut self) {
        let idle = self.slots.iter().filter(|s| s.is_idle()).count();
        let mut wanted = self.chain.missing_blocks(idle).into_iter();
        let (tip_hash, tip_height) = self.chain.tip();

        for slot in 0..self.slots.len() {
            if !self.slots[slot].is_ready() {
                continue;
            }
            if self.slots[slot].advertised_height() > tip_height {
                let locator = BlockLocator {
                    version: self.config.protocol_version as u32,
                    locator: vec![tip_hash],
                    hash_stop: ZERO_HASH,
                };
                self.send_message(slot, &Message::GetHeaders(locator));
            }
            if self.slots[slot].requesting.is_none() {
                if let Some(hash) = wanted.next() {
                    self.send_message(
                        slot,
                        &Message::GetData(vec![InventoryItem {
                            kind: MSG_BLOCK,
                            hash,
                        }]),
                    );
                    self.slots[slot].requesting = Some(hash);
                }
            }
        }
    }

    fn reset_ibd_mode(&mut self) {
        let (_, tip_height) = self.chain.tip();
        let max_full = self.chain.max_full_block_height();
        let was = self.ibd_mode;
        self.ibd_mode = ibd_active(max_full, tip_height, self.config.ibd_availability_threshold);
        if was != self.ibd_mode {
            info!(
                ibd = self.ibd_mode,
                max_full, tip_height, "initial block download mode changed"
            );
        }
    }

    fn print_node_status(&mut self) {
        let mut ready = 0usize;
        for s in &self.slots {
            if !s.is_ready() {
                continue;
            }
            ready += 1;
            match s.ping.average().filter(|_| s.ping.fully_tested()) {
                Some(average) => info!(
                    slot = s.index,
                    latency_ms = format_args!("{average:.1}"),
                    idle_secs = s.last_heard.elapsed().as_secs(),
                    "peer"
                ),
                None => info!(
                    slot = s.index,
                    latency_ms = "-",
                    idle_secs = s.last_heard.elapsed().as_secs(),
                    "peer"
                ),
            }
        }
        let (tip_hash, tip_height) = self.chain.tip();
        info!(
            ready,
            slots = self.slots.len(),
            candidates = self.candidates.len(),
            ibd = self.ibd_mode,
            unknown_commands = self.unknown_commands,
            "node status"
        );
        info!(
            height = tip_height,
            max_full = self.chain.max_full_block_height(),
            tip = %display_hash(&tip_hash),
            "chain status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BlockStatus, MemoryChain};
    use crate::peer::LATENCY_SAMPLES;
    use btc_wire::{Block, BlockHeader};
    use bytes::Bytes;
    use std::net::Ipv4Addr;

    const GENESIS: [u8; 32] = [0xaa; 32];

    fn header_after(prev: [u8; 32], nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 2,
            prev_block: prev,
            merkle_root: [0u8; 32],
            timestamp: 1_500_000_000,
            bits: 0x1d00ffff,
            nonce,
        }
    }

    fn block_for(header: BlockHeader) -> Block {
        Block {
            header,
            txdata: Bytes::new(),
        }
    }

    /// Chain of `headers` headers after genesis, with blocks present for
    /// the first `full` of them.
    fn chain_with(headers: u32, full: u32) -> MemoryChain {
        let mut chain = MemoryChain::new(GENESIS);
        let mut prev = GENESIS;
        let mut chained = Vec::new();
        for nonce in 0..headers {
            let header = header_after(prev, nonce);
            assert_eq!(chain.submit_header(&header), HeaderStatus::New);
            prev = header.hash();
            chained.push(header);
        }
        for header in chained.iter().take(full as usize) {
            assert_eq!(chain.submit_block(&block_for(*header)), BlockStatus::Accepted);
        }
        chain
    }

    fn test_engine(candidates: usize) -> Engine<MemoryChain> {
        let bootstrap = (0..candidates)
            .map(|i| (Ipv4Addr::new(10, 0, 0, 1 + i as u8), 8333u16))
            .collect();
        let config = EngineConfig {
            max_outgoing: 4,
            max_outgoing_ibd: 4,
            ..EngineConfig::default()
        };
        Engine::new(config, MemoryChain::new(GENESIS), bootstrap)
    }

    /// Bind `candidate` into `slot` as if a dial had been issued, returning
    /// the receiving end of its outbound queue.
    fn wire_slot(
        engine: &mut Engine<MemoryChain>,
        slot: usize,
        candidate: usize,
    ) -> mpsc::Receiver<OutboundFrame> {
        let addr = engine.candidates.get(candidate).socket_addr();
        engine.slots[slot].reset_for_dial(candidate, addr);
        engine.candidates.bind_slot(candidate, slot);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        engine.slots[slot].outbound = Some(tx);
        rx
    }

    fn ready_slot(
        engine: &mut Engine<MemoryChain>,
        slot: usize,
        candidate: usize,
        height: i32,
    ) -> mpsc::Receiver<OutboundFrame> {
        let rx = wire_slot(engine, slot, candidate);
        let s = &mut engine.slots[slot];
        s.state = SlotState::Ready;
        s.handshake.they_accepted_us = true;
        s.handshake.we_accept_them = true;
        s.peer_height = height;
        rx
    }

    fn event(slot: usize, generation: u64, event: SlotEvent) -> EngineEvent {
        EngineEvent {
            slot,
            generation,
            event,
        }
    }

    fn frame_for(message: &Message) -> RawFrame {
        RawFrame {
            command: message.command(),
            payload: message.encode_payload(),
        }
    }

    fn feed(engine: &mut Engine<MemoryChain>, slot: usize, message: &Message) {
        let generation = engine.slots[slot].generation;
        engine.handle_event(event(
            slot,
            generation,
            SlotEvent::Frame {
                frame: frame_for(message),
            },
        ));
    }

    fn next_command(rx: &mut mpsc::Receiver<OutboundFrame>) -> Command {
        rx.try_recv().expect("expected an outbound frame").command
    }

    fn sample_version(version: i32, height: i32) -> Message {
        Message::Version(VersionMessage {
            version,
            services: 1,
            timestamp: 0,
            addr_recv: NetworkAddress::zero(),
            addr_from: NetworkAddress::zero(),
            nonce: 9,
            user_agent: "/peer:1.0/".to_string(),
            start_height: height,
            relay: false,
        })
    }

    #[tokio::test]
    async fn test_handshake_scenario_sends_version_verack_getaddr_ping() {
        let mut engine = test_engine(2);
        let mut rx = wire_slot(&mut engine, 0, 0);
        let generation = engine.slots[0].generation;

        engine.handle_event(event(0, generation, SlotEvent::Connected));
        assert_eq!(engine.slots[0].state, SlotState::Handshaking);
        assert_eq!(next_command(&mut rx), Command::Version);

        feed(&mut engine, 0, &sample_version(70015, 100));
        assert!(engine.slots[0].handshake.we_accept_them);
        assert_eq!(engine.slots[0].state, SlotState::Handshaking);
        assert_eq!(engine.slots[0].peer_height, 100);
        assert_eq!(engine.slots[0].peer_services, 1);

        feed(&mut engine, 0, &Message::Verack);
        assert_eq!(engine.slots[0].state, SlotState::Ready);
        assert_eq!(next_command(&mut rx), Command::Verack);
        // Registry is below the getaddr threshold.
        assert_eq!(next_command(&mut rx), Command::GetAddr);
        assert_eq!(next_command(&mut rx), Command::Ping);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_low_version_peer_never_becomes_ready() {
        let mut engine = test_engine(1);
        let mut rx = wire_slot(&mut engine, 0, 0);
        engine.slots[0].state = SlotState::Handshaking;

        feed(&mut engine, 0, &sample_version(60002, 100));
        assert!(!engine.slots[0].handshake.we_accept_them);

        feed(&mut engine, 0, &Message::Verack);
        assert_eq!(next_command(&mut rx), Command::Verack);
        assert_ne!(engine.slots[0].state, SlotState::Ready);
    }

    #[tokio::test]
    async fn test_duplicate_verack_runs_post_handshake_once() {
        let mut engine = test_engine(1);
        let mut rx = wire_slot(&mut engine, 0, 0);
        engine.slots[0].state = SlotState::Handshaking;

        feed(&mut engine, 0, &sample_version(70015, 100));
        feed(&mut engine, 0, &Message::Verack);
        let first_flurry: Vec<Command> =
            std::iter::from_fn(|| rx.try_recv().ok().map(|f| f.command)).collect();
        assert_eq!(
            first_flurry,
            vec![Command::Verack, Command::GetAddr, Command::Ping]
        );

        feed(&mut engine, 0, &Message::Verack);
        // Only the verack echo, no second getaddr/ping.
        assert_eq!(next_command(&mut rx), Command::Verack);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_inbound_ping_is_answered_with_same_nonce() {
        let mut engine = test_engine(1);
        let mut rx = ready_slot(&mut engine, 0, 0, 0);

        feed(&mut engine, 0, &Message::Ping(0x5151));
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.command, Command::Pong);
        assert_eq!(
            reply.bytes,
            encode_message(engine.config.params.magic, &Message::Pong(0x5151))
        );
    }

    #[tokio::test]
    async fn test_pong_latency_flow_updates_candidate_average() {
        let mut engine = test_engine(1);
        let mut rx = ready_slot(&mut engine, 0, 0, 0);
        let generation = engine.slots[0].generation;

        for _ in 0..LATENCY_SAMPLES {
            engine.ping_peer(0);
            assert_eq!(next_command(&mut rx), Command::Ping);
            engine.handle_event(event(0, generation, SlotEvent::Wrote { command: Command::Ping }));
            assert!(engine.slots[0].ping.sent_at.is_some());
            let nonce = engine.slots[0].ping.nonce;
            feed(&mut engine, 0, &Message::Pong(nonce));
            assert!(engine.slots[0].ping.pong_at.is_some());
        }

        assert!(engine.slots[0].ping.fully_tested());
        let average = engine.slots[0].ping.average().unwrap();
        assert_eq!(engine.candidates.get(0).avg_latency_ms, average);
    }

    #[tokio::test]
    async fn test_stale_pong_nonce_is_ignored() {
        let mut engine = test_engine(1);
        let mut rx = ready_slot(&mut engine, 0, 0, 0);
        let generation = engine.slots[0].generation;

        engine.ping_peer(0);
        assert_eq!(next_command(&mut rx), Command::Ping);
        engine.handle_event(event(0, generation, SlotEvent::Wrote { command: Command::Ping }));

        let nonce = engine.slots[0].ping.nonce;
        feed(&mut engine, 0, &Message::Pong(nonce.wrapping_add(1)));

        // Latency untouched and the pending ping not cleared.
        assert!(engine.slots[0].ping.pong_at.is_none());
        assert!(engine.slots[0].ping.average().is_none());
    }

    #[tokio::test]
    async fn test_addr_gossip_feeds_registry_and_skips_non_ipv4() {
        let mut engine = test_engine(1);
        let _rx = ready_slot(&mut engine, 0, 0, 0);
        let before = engine.candidates.len();

        let records = vec![
            TimestampedAddress {
                time: unix_time_secs() as u32,
                addr: NetworkAddress::ipv4(Ipv4Addr::new(93, 184, 216, 34), 8333, 1),
            },
            TimestampedAddress {
                time: unix_time_secs() as u32,
                addr: NetworkAddress {
                    services: 1,
                    ip: [0x20, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
                    port: 8333,
                },
            },
        ];
        feed(&mut engine, 0, &Message::Addr(records));

        assert_eq!(engine.candidates.len(), before + 1);
    }

    #[tokio::test]
    async fn test_block_sync_assigns_one_request_per_idle_peer() {
        let chain = chain_with(2, 0);
        let wanted = chain.missing_blocks(2);
        let mut engine = Engine::new(
            EngineConfig {
                max_outgoing: 4,
                max_outgoing_ibd: 4,
                ..EngineConfig::default()
            },
            chain,
            vec![
                (Ipv4Addr::new(10, 0, 0, 1), 8333),
                (Ipv4Addr::new(10, 0, 0, 2), 8333),
            ],
        );
        let mut rx_a = ready_slot(&mut engine, 0, 0, 2);
        let mut rx_b = ready_slot(&mut engine, 1, 1, 2);

        engine.exchange_data_with_peers();

        assert_eq!(next_command(&mut rx_a), Command::GetData);
        assert_eq!(next_command(&mut rx_b), Command::GetData);
        assert_eq!(engine.slots[0].requesting, Some(wanted[0]));
        assert_eq!(engine.slots[1].requesting, Some(wanted[1]));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());

        // A second tick must not double-request while peers are busy.
        engine.exchange_data_with_peers();
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());

        // Delivering the requested block frees the peer again.
        let header = header_after(GENESIS, 0);
        assert_eq!(header.hash(), wanted[0]);
        feed(&mut engine, 0, &Message::Block(block_for(header)));
        assert!(engine.slots[0].requesting.is_none());
    }

    #[tokio::test]
    async fn test_taller_peer_triggers_getheaders_at_tip() {
        let mut engine = test_engine(1);
        let mut rx = ready_slot(&mut engine, 0, 0, 4000);

        engine.exchange_data_with_peers();

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.command, Command::GetHeaders);
    }

    #[tokio::test]
    async fn test_handshake_timeout_disables_candidate_and_redials() {
        // A single slot, so the sweep cannot hand the spare candidate to
        // another slot before the close completes.
        let config = EngineConfig {
            max_outgoing: 1,
            max_outgoing_ibd: 1,
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(
            config,
            MemoryChain::new(GENESIS),
            vec![
                (Ipv4Addr::new(10, 0, 0, 1), 8333),
                (Ipv4Addr::new(10, 0, 0, 2), 8333),
            ],
        );
        let _rx = wire_slot(&mut engine, 0, 0);
        engine.slots[0].state = SlotState::Handshaking;
        engine.slots[0].handshake.started_at =
            Instant::now() - std::time::Duration::from_millis(engine.config.tolerances.handshake + 1);

        engine.check_peers_connectivity();

        assert_eq!(
            engine.candidates.get(0).status,
            crate::candidates::CandidateStatus::Disabled
        );
        assert_eq!(engine.slots[0].state, SlotState::Closing);
        assert!(engine.slots[0].close_pending);

        // Close completion dials the other candidate into the same slot.
        let generation = engine.slots[0].generation;
        engine.handle_event(event(
            0,
            generation,
            SlotEvent::Closed {
                reason: CloseReason::Replaced,
            },
        ));
        assert_eq!(engine.slots[0].state, SlotState::Dialing);
        assert_eq!(engine.slots[0].candidate, Some(1));
        assert_eq!(engine.candidates.get(0).slot, None);
    }

    #[tokio::test]
    async fn test_no_two_slots_share_a_candidate() {
        let mut engine = test_engine(1);
        engine.dial_next_candidate(0);
        engine.dial_next_candidate(1);

        assert_eq!(engine.slots[0].candidate, Some(0));
        assert_eq!(engine.slots[0].state, SlotState::Dialing);
        // The only candidate is taken; the second slot defers.
        assert_eq!(engine.slots[1].candidate, None);
        assert_eq!(engine.slots[1].state, SlotState::Empty);
    }

    #[tokio::test]
    async fn test_ibd_mode_hysteresis_around_threshold() {
        let chain = chain_with(1000, 949);
        let mut engine = Engine::new(EngineConfig::default(), chain, Vec::new());

        engine.reset_ibd_mode();
        assert!(engine.ibd_mode, "949/1000 is at most the 0.95 threshold");

        // Deliver blocks up to height 960.
        let mut prev = GENESIS;
        let mut headers = Vec::new();
        for nonce in 0..1000 {
            let header = header_after(prev, nonce);
            prev = header.hash();
            headers.push(header);
        }
        for header in headers.iter().take(960).skip(949) {
            engine.chain.submit_block(&block_for(*header));
        }

        engine.reset_ibd_mode();
        assert!(!engine.ibd_mode, "0.96 exceeds the 0.95 threshold");
    }

    #[tokio::test]
    async fn test_post_handshake_in_ibd_replaces_short_peer() {
        let chain = chain_with(100, 50);
        let mut engine = Engine::new(
            EngineConfig {
                max_outgoing: 4,
                max_outgoing_ibd: 4,
                ..EngineConfig::default()
            },
            chain,
            vec![(Ipv4Addr::new(10, 0, 0, 1), 8333)],
        );
        assert!(engine.ibd_mode);

        let _rx = wire_slot(&mut engine, 0, 0);
        engine.slots[0].state = SlotState::Handshaking;
        // Peer advertises less than our contiguous height of 50.
        feed(&mut engine, 0, &sample_version(70015, 10));
        feed(&mut engine, 0, &Message::Verack);

        assert_eq!(engine.slots[0].state, SlotState::Closing);
    }

    #[tokio::test]
    async fn test_stale_generation_events_are_dropped() {
        let mut engine = test_engine(2);
        let _rx = wire_slot(&mut engine, 0, 0);
        let stale = engine.slots[0].generation;
        engine.slots[0].generation += 1;

        engine.handle_event(event(
            0,
            stale,
            SlotEvent::Closed {
                reason: CloseReason::ReadError,
            },
        ));
        // A live event would have re-dialed; the stale one changed nothing.
        assert_eq!(engine.slots[0].state, SlotState::Dialing);
    }

    #[tokio::test]
    async fn test_unknown_commands_are_counted_and_dropped() {
        let mut engine = test_engine(1);
        let _rx = ready_slot(&mut engine, 0, 0, 0);
        let generation = engine.slots[0].generation;

        let mut name = [0u8; 12];
        name[..8].copy_from_slice(b"sendcmpt");
        engine.handle_event(event(
            0,
            generation,
            SlotEvent::Frame {
                frame: RawFrame {
                    command: Command::from_bytes(name),
                    payload: Bytes::new(),
                },
            },
        ));

        assert_eq!(engine.unknown_commands, 1);
        assert_eq!(engine.slots[0].state, SlotState::Ready);
    }

    #[tokio::test]
    async fn test_only_decodable_frames_refresh_candidate_last_seen() {
        let mut engine = test_engine(1);
        let _rx = ready_slot(&mut engine, 0, 0, 0);
        let generation = engine.slots[0].generation;
        engine.candidates.get_mut(0).last_seen = 1;

        // An unknown command is dropped before dispatch.
        let mut name = [0u8; 12];
        name[..8].copy_from_slice(b"sendcmpt");
        engine.handle_event(event(
            0,
            generation,
            SlotEvent::Frame {
                frame: RawFrame {
                    command: Command::from_bytes(name),
                    payload: Bytes::new(),
                },
            },
        ));
        assert_eq!(engine.candidates.get(0).last_seen, 1);

        // So is a known command whose payload fails to decode.
        engine.handle_event(event(
            0,
            generation,
            SlotEvent::Frame {
                frame: RawFrame {
                    command: Command::Ping,
                    payload: Bytes::new(),
                },
            },
        ));
        assert_eq!(engine.candidates.get(0).last_seen, 1);

        // A message that dispatches refreshes the candidate.
        feed(&mut engine, 0, &Message::Ping(1));
        assert!(engine.candidates.get(0).last_seen >= unix_time_secs() - 1);
    }

    #[tokio::test]
    async fn test_eof_close_waits_for_sweep_to_redial() {
        let mut engine = test_engine(2);
        let _rx = ready_slot(&mut engine, 0, 0, 0);
        let generation = engine.slots[0].generation;

        engine.handle_event(event(
            0,
            generation,
            SlotEvent::Closed {
                reason: CloseReason::Eof,
            },
        ));
        assert_eq!(engine.slots[0].state, SlotState::Closing);
        assert!(!engine.slots[0].close_pending);

        engine.check_peers_connectivity();
        assert_eq!(engine.slots[0].state, SlotState::Dialing);
    }
}
