//! Chain-store facade.
//!
//! Header and block validation, persistence, and fork choice live outside
//! this crate. The engine consumes the [`ChainStore`] trait mutably from its
//! single loop, so implementations need no interior locking.

use btc_wire::{Block, BlockHash, BlockHeader};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Outcome of submitting a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStatus {
    /// Extended the chain.
    New,
    /// Already known.
    Existed,
    /// Failed validation.
    Invalid,
    /// Parent unknown.
    Orphan,
}

/// Outcome of submitting a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Stored.
    Accepted,
    /// Already stored.
    Existed,
    /// Failed validation.
    Invalid,
    /// No header for it yet.
    Orphan,
}

/// Interface the engine requires from the chain store.
pub trait ChainStore {
    /// Best known header: hash and height.
    fn tip(&self) -> (BlockHash, u32);

    /// Highest height for which every block from genesis is present.
    fn max_full_block_height(&self) -> u32;

    /// Up to `limit` block hashes the store still wants, in priority order.
    fn missing_blocks(&self, limit: usize) -> Vec<BlockHash>;

    /// Offer a header received from the network.
    fn submit_header(&mut self, header: &BlockHeader) -> HeaderStatus;

    /// Offer a full block received from the network.
    fn submit_block(&mut self, block: &Block) -> BlockStatus;

    /// Persist whatever the store considers durable state.
    fn save(&mut self);
}

/// Linear in-memory chain store.
///
/// Tracks a single header chain and which of its blocks have arrived.
/// Good enough to drive the engine in tests and smoke runs; it does not
/// follow forks or validate anything beyond parent linkage.
#[derive(Debug)]
pub struct MemoryChain {
    heights: HashMap<BlockHash, u32>,
    by_height: Vec<BlockHash>,
    blocks: HashSet<BlockHash>,
    max_full: u32,
}

impl MemoryChain {
    /// A chain holding only the genesis block.
    pub fn new(genesis: BlockHash) -> Self {
        let mut heights = HashMap::new();
        heights.insert(genesis, 0);
        let mut blocks = HashSet::new();
        blocks.insert(genesis);
        Self {
            heights,
            by_height: vec![genesis],
            blocks,
            max_full: 0,
        }
    }

    fn advance_max_full(&mut self) {
        while (self.max_full as usize + 1) < self.by_height.len() {
            let next = self.by_height[self.max_full as usize + 1];
            if !self.blocks.contains(&next) {
                break;
            }
            self.max_full += 1;
        }
    }
}

impl ChainStore for MemoryChain {
    fn tip(&self) -> (BlockHash, u32) {
        let height = (self.by_height.len() - 1) as u32;
        (self.by_height[height as usize], height)
    }

    fn max_full_block_height(&self) -> u32 {
        self.max_full
    }

    fn missing_blocks(&self, limit: usize) -> Vec<BlockHash> {
        self.by_height
            .iter()
            .skip(self.max_full as usize + 1)
            .filter(|hash| !self.blocks.contains(*hash))
            .take(limit)
            .copied()
            .collect()
    }

    fn submit_header(&mut self, header: &BlockHeader) -> HeaderStatus {
        let hash = header.hash();
        if self.heights.contains_key(&hash) {
            return HeaderStatus::Existed;
        }
        let (tip_hash, tip_height) = self.tip();
        if header.prev_block == tip_hash {
            self.heights.insert(hash, tip_height + 1);
            self.by_height.push(hash);
            return HeaderStatus::New;
        }
        // A known but non-tip parent would start a fork, which this store
        // does not track.
        HeaderStatus::Orphan
    }

    fn submit_block(&mut self, block: &Block) -> BlockStatus {
        let hash = block.hash();
        if !self.heights.contains_key(&hash) {
            return BlockStatus::Orphan;
        }
        if !self.blocks.insert(hash) {
            return BlockStatus::Existed;
        }
        self.advance_max_full();
        BlockStatus::Accepted
    }

    fn save(&mut self) {
        debug!(
            tip = self.by_height.len() - 1,
            max_full = self.max_full,
            "in-memory chain has nothing durable to save"
        );
    }
}
