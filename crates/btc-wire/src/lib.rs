//! # btc-wire
//!
//! Bitcoin P2P wire protocol primitives.
//!
//! This crate provides:
//! - Network parameters (magic bytes, ports, minimal peer versions)
//! - Double-SHA-256 payload checksums
//! - Typed protocol messages with byte-exact encode/decode
//! - Frame extraction from raw TCP byte streams

mod codec;
mod error;
mod message;

pub use codec::{FrameCodec, RawFrame, HEADER_SIZE, MAX_PAYLOAD_SIZE, STREAM_BUFFER_CAPACITY};
pub use error::{WireError, WireResult};
pub use message::{
    encode_message, Block, BlockHeader, BlockLocator, Command, InventoryItem, Message,
    NetworkAddress, Reject, TimestampedAddress, VersionMessage, MSG_BLOCK, MSG_TX,
};

use sha2::{Digest, Sha256};

/// A block or transaction hash in internal (little-endian) byte order.
pub type BlockHash = [u8; 32];

/// The all-zero hash, used as a "none" sentinel on the wire.
pub const ZERO_HASH: BlockHash = [0u8; 32];

/// Service bit advertising a full network node.
pub const SERVICE_NODE_NETWORK: u64 = 1;

/// Static parameters of a Bitcoin network.
#[derive(Debug, Clone, Copy)]
pub struct NetworkParams {
    /// Four-byte constant framing every wire message.
    pub magic: [u8; 4],
    /// Default P2P port.
    pub default_port: u16,
    /// Lowest protocol version we accept from a peer.
    pub minimal_peer_version: i32,
    /// Genesis block hash (internal byte order).
    pub genesis_hash: BlockHash,
}

/// Mainnet parameters.
pub const MAINNET: NetworkParams = NetworkParams {
    magic: [0xf9, 0xbe, 0xb4, 0xd9],
    default_port: 8333,
    minimal_peer_version: 70001,
    genesis_hash: [
        0x6f, 0xe2, 0x8c, 0x0a, 0xb6, 0xf1, 0xb3, 0x72, 0xc1, 0xa6, 0xa2, 0x46, 0xae, 0x63, 0xf7,
        0x4f, 0x93, 0x1e, 0x83, 0x65, 0xe1, 0x5a, 0x08, 0x9c, 0x68, 0xd6, 0x19, 0x00, 0x00, 0x00,
        0x00, 0x00,
    ],
};

/// Testnet3 parameters.
pub const TESTNET: NetworkParams = NetworkParams {
    magic: [0x0b, 0x11, 0x09, 0x07],
    default_port: 18333,
    minimal_peer_version: 70001,
    genesis_hash: [
        0x43, 0x49, 0x7f, 0xd7, 0xf8, 0x26, 0x95, 0x71, 0x08, 0xf4, 0xa3, 0x0f, 0xd9, 0xce, 0xc3,
        0xae, 0xba, 0x79, 0x97, 0x20, 0x84, 0xe9, 0x0e, 0xad, 0x01, 0xea, 0x33, 0x09, 0x00, 0x00,
        0x00, 0x00,
    ],
};

/// Double SHA-256 over `data`.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Payload checksum: first four bytes of the double SHA-256.
pub fn payload_checksum(payload: &[u8]) -> [u8; 4] {
    let hash = sha256d(payload);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&hash[0..4]);
    checksum
}

/// Render a hash in the conventional display order (byte-reversed hex).
pub fn display_hash(hash: &BlockHash) -> String {
    let mut bytes = *hash;
    bytes.reverse();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_of_empty_payload() {
        // Well-known value: first four bytes of sha256d("").
        assert_eq!(payload_checksum(b""), [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_sha256d_differs_from_single_round() {
        let single = Sha256::digest(b"abc");
        let double = sha256d(b"abc");
        assert_ne!(&double[..], &single[..]);
    }

    #[test]
    fn test_genesis_display_order() {
        let displayed = display_hash(&MAINNET.genesis_hash);
        assert!(displayed.starts_with("000000000019d668"));
    }
}
