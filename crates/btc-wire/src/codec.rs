//! Frame extraction from raw peer byte streams.
//!
//! Every message on the wire is framed as:
//!
//! ```text
//! +----------+-------------+----------+----------+
//! |  Magic   |   Command   |  Length  | Checksum |
//! | 4 bytes  |  12 bytes   | 4 bytes  | 4 bytes  |
//! +----------+-------------+----------+----------+
//! |                 Payload                      |
//! |              (Length bytes)                  |
//! +----------------------------------------------+
//! ```
//!
//! - Magic: network identifier (mainnet/testnet)
//! - Command: NUL-padded ASCII command name
//! - Length: payload length in bytes (little-endian)
//! - Checksum: first 4 bytes of SHA256(SHA256(payload))
//!
//! The decoder scans for the magic, trims any preceding noise, and only
//! emits frames whose checksum verifies. A mismatched checksum advances the
//! scan a single byte past the start of the magic: the magic was spurious
//! and a genuine frame may begin inside the corrupt region.

use crate::error::WireError;
use crate::message::Command;
use crate::payload_checksum;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

/// Size of the fixed message header.
pub const HEADER_SIZE: usize = 24;

/// Capacity of the per-peer stream buffer.
pub const STREAM_BUFFER_CAPACITY: usize = 64 * 1024;

/// Largest payload a peer may declare. Anything bigger cannot fit the
/// stream buffer and marks the peer as desynced or malicious.
pub const MAX_PAYLOAD_SIZE: usize = STREAM_BUFFER_CAPACITY - HEADER_SIZE;

/// A checksum-verified frame, not yet decoded into a typed message.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Command name from the header.
    pub command: Command,
    /// Payload bytes.
    pub payload: Bytes,
}

/// Stream decoder producing [`RawFrame`]s.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    magic: [u8; 4],
}

impl FrameCodec {
    /// Create a codec for the given network magic.
    pub fn new(magic: [u8; 4]) -> Self {
        Self { magic }
    }

    fn find_magic(&self, buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == self.magic.as_slice())
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, WireError> {
        loop {
            let Some(offset) = self.find_magic(src) else {
                // No magic in sight. Keep a three-byte tail in case the
                // magic straddles a segment boundary.
                if src.len() > 3 {
                    let dropped = src.len() - 3;
                    src.advance(dropped);
                    debug!(dropped, "discarded non-magic bytes");
                }
                return Ok(None);
            };
            if offset > 0 {
                src.advance(offset);
                debug!(trimmed = offset, "trimmed noise preceding magic");
            }
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            let length = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
            if length > MAX_PAYLOAD_SIZE {
                return Err(WireError::OversizedPayload {
                    size: length,
                    max: MAX_PAYLOAD_SIZE,
                });
            }

            let total = HEADER_SIZE + length;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let mut expected = [0u8; 4];
            expected.copy_from_slice(&src[20..24]);
            if payload_checksum(&src[HEADER_SIZE..total]) != expected {
                warn!("payload checksum mismatch, resuming scan past magic");
                src.advance(1);
                continue;
            }

            let mut name = [0u8; 12];
            name.copy_from_slice(&src[4..16]);
            src.advance(HEADER_SIZE);
            let payload = src.split_to(length).freeze();
            return Ok(Some(RawFrame {
                command: Command::from_bytes(name),
                payload,
            }));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, WireError> {
        let frame = self.decode(src)?;
        if frame.is_none() && !src.is_empty() {
            debug!(leftover = src.len(), "discarding partial frame at stream end");
            src.clear();
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{encode_message, Message};
    use crate::MAINNET;
    use proptest::prelude::*;

    fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = codec.decode(buf) {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_single_frame_roundtrip() {
        let mut codec = FrameCodec::new(MAINNET.magic);
        let mut buf = BytesMut::from(&encode_message(MAINNET.magic, &Message::Ping(42))[..]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command, Command::Ping);
        assert_eq!(frame.payload.len(), 8);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_noise_before_magic_is_trimmed() {
        let mut codec = FrameCodec::new(MAINNET.magic);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00, 0x17, 0x2a, 0x41, 0x41]);
        buf.extend_from_slice(&encode_message(MAINNET.magic, &Message::Ping(7)));

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command, Command::Ping);
    }

    #[test]
    fn test_partial_header_waits_for_more_bytes() {
        let mut codec = FrameCodec::new(MAINNET.magic);
        let encoded = encode_message(MAINNET.magic, &Message::Ping(7));
        let mut buf = BytesMut::from(&encoded[..10]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[10..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_checksum_mismatch_skips_to_next_frame() {
        let mut codec = FrameCodec::new(MAINNET.magic);
        let mut corrupt = encode_message(MAINNET.magic, &Message::Ping(1)).to_vec();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xff;

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&corrupt);
        buf.extend_from_slice(&encode_message(MAINNET.magic, &Message::Ping(2)));

        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 1);
        let Ok(Message::Ping(nonce)) = Message::decode(&frames[0]) else {
            panic!("expected ping");
        };
        assert_eq!(nonce, 2);
    }

    fn raw_frame_with_length(length: usize) -> Vec<u8> {
        let payload = vec![0xabu8; length];
        let mut bytes = Vec::with_capacity(HEADER_SIZE + length);
        bytes.extend_from_slice(&MAINNET.magic);
        let mut name = [0u8; 12];
        name[..5].copy_from_slice(b"weird");
        bytes.extend_from_slice(&name);
        bytes.extend_from_slice(&(length as u32).to_le_bytes());
        bytes.extend_from_slice(&payload_checksum(&payload));
        bytes.extend_from_slice(&payload);
        bytes
    }

    #[test]
    fn test_payload_at_capacity_is_accepted() {
        let mut codec = FrameCodec::new(MAINNET.magic);
        let mut buf = BytesMut::from(&raw_frame_with_length(MAX_PAYLOAD_SIZE)[..]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.len(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_payload_over_capacity_is_fatal() {
        let mut codec = FrameCodec::new(MAINNET.magic);
        let mut header = Vec::new();
        header.extend_from_slice(&MAINNET.magic);
        header.extend_from_slice(&[0u8; 12]);
        header.extend_from_slice(&((MAX_PAYLOAD_SIZE + 1) as u32).to_le_bytes());
        header.extend_from_slice(&[0u8; 4]);
        let mut buf = BytesMut::from(&header[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::OversizedPayload { .. })
        ));
    }

    proptest! {
        /// Any chunking of valid frames interleaved with magic-free noise
        /// re-emits exactly those frames in order.
        #[test]
        fn prop_frames_survive_arbitrary_chunking(
            nonces in prop::collection::vec(any::<u64>(), 1..8),
            noise in prop::collection::vec(0u8..0x80, 0..40),
            cut in any::<prop::sample::Index>(),
        ) {
            let mut stream = Vec::new();
            stream.extend_from_slice(&noise);
            for nonce in &nonces {
                stream.extend_from_slice(&encode_message(MAINNET.magic, &Message::Ping(*nonce)));
            }

            let split = cut.index(stream.len().max(1));
            let mut codec = FrameCodec::new(MAINNET.magic);
            let mut buf = BytesMut::new();
            let mut frames = Vec::new();

            buf.extend_from_slice(&stream[..split]);
            frames.extend(decode_all(&mut codec, &mut buf));
            buf.extend_from_slice(&stream[split..]);
            frames.extend(decode_all(&mut codec, &mut buf));

            prop_assert_eq!(frames.len(), nonces.len());
            for (frame, nonce) in frames.iter().zip(&nonces) {
                let Ok(Message::Ping(got)) = Message::decode(frame) else {
                    return Err(TestCaseError::fail("expected ping"));
                };
                prop_assert_eq!(got, *nonce);
            }
        }
    }
}
