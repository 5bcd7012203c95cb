//! Typed P2P protocol messages.
//!
//! All multibyte integers are little-endian except port numbers inside
//! network address records, which the protocol serializes big-endian.
//! Variable-length integers use the `CompactSize` scheme.

use crate::codec::{RawFrame, HEADER_SIZE};
use crate::error::WireError;
use crate::{payload_checksum, BlockHash};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::Ipv4Addr;

/// Upper bound on records in a single `addr` payload.
const MAX_ADDR_ENTRIES: u64 = 1000;

/// Upper bound on entries in a single `headers` payload.
const MAX_HEADERS_ENTRIES: u64 = 2000;

/// Upper bound on inventory vectors in `inv`/`getdata`.
const MAX_INV_ENTRIES: u64 = 50_000;

/// Upper bound on a user-agent string.
const MAX_USER_AGENT_LEN: u64 = 256;

/// Upper bound on `reject` strings.
const MAX_REJECT_STRING_LEN: u64 = 2048;

/// Inventory vector type for a transaction.
pub const MSG_TX: u32 = 1;

/// Inventory vector type for a full block.
pub const MSG_BLOCK: u32 = 2;

fn need(buf: &Bytes, len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        Err(WireError::Truncated)
    } else {
        Ok(())
    }
}

/// Write a `CompactSize` integer.
fn put_compact_size(buf: &mut BytesMut, value: u64) {
    match value {
        0..=0xfc => buf.put_u8(value as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(value as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(value);
        }
    }
}

/// Read a `CompactSize` integer.
fn get_compact_size(buf: &mut Bytes) -> Result<u64, WireError> {
    need(buf, 1)?;
    match buf.get_u8() {
        0xfd => {
            need(buf, 2)?;
            Ok(buf.get_u16_le() as u64)
        }
        0xfe => {
            need(buf, 4)?;
            Ok(buf.get_u32_le() as u64)
        }
        0xff => {
            need(buf, 8)?;
            Ok(buf.get_u64_le())
        }
        small => Ok(small as u64),
    }
}

fn put_var_str(buf: &mut BytesMut, value: &str) {
    put_compact_size(buf, value.len() as u64);
    buf.put_slice(value.as_bytes());
}

fn get_var_str(buf: &mut Bytes, max_len: u64) -> Result<String, WireError> {
    let len = get_compact_size(buf)?;
    if len > max_len {
        return Err(WireError::Malformed(format!("string of {len} bytes")));
    }
    need(buf, len as usize)?;
    let raw = buf.copy_to_bytes(len as usize);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::Malformed("non-utf8 string".into()))
}

fn get_hash(buf: &mut Bytes) -> Result<BlockHash, WireError> {
    need(buf, 32)?;
    let mut hash = [0u8; 32];
    buf.copy_to_slice(&mut hash);
    Ok(hash)
}

/// Wire command names, 12-byte NUL-padded ASCII on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Version,
    Verack,
    Ping,
    Pong,
    Addr,
    GetAddr,
    Inv,
    GetData,
    GetHeaders,
    GetBlocks,
    SendHeaders,
    Headers,
    Block,
    Reject,
    /// Anything outside the supported set, raw header bytes preserved.
    Unknown([u8; 12]),
}

impl Command {
    /// Decode a 12-byte command field.
    pub fn from_bytes(raw: [u8; 12]) -> Self {
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        match &raw[..end] {
            b"version" => Command::Version,
            b"verack" => Command::Verack,
            b"ping" => Command::Ping,
            b"pong" => Command::Pong,
            b"addr" => Command::Addr,
            b"getaddr" => Command::GetAddr,
            b"inv" => Command::Inv,
            b"getdata" => Command::GetData,
            b"getheaders" => Command::GetHeaders,
            b"getblocks" => Command::GetBlocks,
            b"sendheaders" => Command::SendHeaders,
            b"headers" => Command::Headers,
            b"block" => Command::Block,
            b"reject" => Command::Reject,
            _ => Command::Unknown(raw),
        }
    }

    /// Encode to the 12-byte wire field.
    pub fn to_bytes(self) -> [u8; 12] {
        if let Command::Unknown(raw) = self {
            return raw;
        }
        let mut out = [0u8; 12];
        let name = self.name().as_bytes();
        out[..name.len()].copy_from_slice(name);
        out
    }

    /// Canonical name for logging and config matching.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Addr => "addr",
            Command::GetAddr => "getaddr",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::GetHeaders => "getheaders",
            Command::GetBlocks => "getblocks",
            Command::SendHeaders => "sendheaders",
            Command::Headers => "headers",
            Command::Block => "block",
            Command::Reject => "reject",
            Command::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Unknown(raw) => {
                let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                write!(f, "{}", String::from_utf8_lossy(&raw[..end]))
            }
            known => write!(f, "{}", known.name()),
        }
    }
}

/// Network address record as embedded in `version` (26 bytes, no time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkAddress {
    /// Advertised service bits.
    pub services: u64,
    /// IPv6 address, or an IPv4-mapped one.
    pub ip: [u8; 16],
    /// Port, big-endian on the wire.
    pub port: u16,
}

impl NetworkAddress {
    /// An all-zero address, used for `addr_from` in outbound `version`.
    pub fn zero() -> Self {
        Self {
            services: 0,
            ip: [0u8; 16],
            port: 0,
        }
    }

    /// Build an IPv4-mapped address record.
    pub fn ipv4(addr: Ipv4Addr, port: u16, services: u64) -> Self {
        let mut ip = [0u8; 16];
        ip[10] = 0xff;
        ip[11] = 0xff;
        ip[12..].copy_from_slice(&addr.octets());
        Self { services, ip, port }
    }

    /// Extract the IPv4 address if this record is IPv4-mapped.
    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        let mapped = self.ip[..10].iter().all(|b| *b == 0) && self.ip[10] == 0xff && self.ip[11] == 0xff;
        if mapped {
            Some(Ipv4Addr::new(self.ip[12], self.ip[13], self.ip[14], self.ip[15]))
        } else {
            None
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.services);
        buf.put_slice(&self.ip);
        buf.put_u16(self.port);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, 26)?;
        let services = buf.get_u64_le();
        let mut ip = [0u8; 16];
        buf.copy_to_slice(&mut ip);
        let port = buf.get_u16();
        Ok(Self { services, ip, port })
    }
}

/// Address record from an `addr` payload (30 bytes, with time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampedAddress {
    /// Last-seen time in unix seconds, as claimed by the relaying peer.
    pub time: u32,
    /// The address itself.
    pub addr: NetworkAddress,
}

/// Payload of a `version` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetworkAddress,
    pub addr_from: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.version);
        buf.put_u64_le(self.services);
        buf.put_i64_le(self.timestamp);
        self.addr_recv.encode_into(buf);
        self.addr_from.encode_into(buf);
        buf.put_u64_le(self.nonce);
        put_var_str(buf, &self.user_agent);
        buf.put_i32_le(self.start_height);
        buf.put_u8(self.relay as u8);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, 20)?;
        let version = buf.get_i32_le();
        let services = buf.get_u64_le();
        let timestamp = buf.get_i64_le();
        let addr_recv = NetworkAddress::decode(buf)?;
        let addr_from = NetworkAddress::decode(buf)?;
        need(buf, 8)?;
        let nonce = buf.get_u64_le();
        let user_agent = get_var_str(buf, MAX_USER_AGENT_LEN)?;
        need(buf, 4)?;
        let start_height = buf.get_i32_le();
        // Pre-70001 encoders omit the relay flag.
        let relay = buf.has_remaining() && buf.get_u8() != 0;
        Ok(Self {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

/// A single inventory vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryItem {
    /// Object type, see [`MSG_BLOCK`] and [`MSG_TX`].
    pub kind: u32,
    /// Object hash.
    pub hash: BlockHash,
}

/// Payload shared by `getheaders` and `getblocks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocator {
    pub version: u32,
    /// Known block hashes, newest first.
    pub locator: Vec<BlockHash>,
    /// Hash to stop at; all-zero requests as many as allowed.
    pub hash_stop: BlockHash,
}

impl BlockLocator {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.version);
        put_compact_size(buf, self.locator.len() as u64);
        for hash in &self.locator {
            buf.put_slice(hash);
        }
        buf.put_slice(&self.hash_stop);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, 4)?;
        let version = buf.get_u32_le();
        let count = get_compact_size(buf)?;
        if count > MAX_HEADERS_ENTRIES {
            return Err(WireError::Malformed(format!("{count} locator hashes")));
        }
        let mut locator = Vec::with_capacity(count as usize);
        for _ in 0..count {
            locator.push(get_hash(buf)?);
        }
        let hash_stop = get_hash(buf)?;
        Ok(Self {
            version,
            locator,
            hash_stop,
        })
    }
}

/// An 80-byte block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: BlockHash,
    pub merkle_root: BlockHash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Serialized size on the wire.
    pub const SIZE: usize = 80;

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.version);
        buf.put_slice(&self.prev_block);
        buf.put_slice(&self.merkle_root);
        buf.put_u32_le(self.timestamp);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.nonce);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        need(buf, Self::SIZE)?;
        let version = buf.get_i32_le();
        let prev_block = get_hash(buf)?;
        let merkle_root = get_hash(buf)?;
        let timestamp = buf.get_u32_le();
        let bits = buf.get_u32_le();
        let nonce = buf.get_u32_le();
        Ok(Self {
            version,
            prev_block,
            merkle_root,
            timestamp,
            bits,
            nonce,
        })
    }

    /// Hash of the serialized header (internal byte order).
    pub fn hash(&self) -> BlockHash {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.encode_into(&mut buf);
        crate::sha256d(&buf)
    }
}

/// Payload of a `block` message.
///
/// Transactions stay as opaque bytes: validating them is the chain store's
/// job, and the networking layer only needs the header hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    /// Serialized transactions, including their leading count.
    pub txdata: Bytes,
}

impl Block {
    /// Hash identifying this block.
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }
}

/// Payload of a `reject` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    /// Command being rejected.
    pub message: String,
    /// Rejection code.
    pub code: u8,
    /// Human-readable reason.
    pub reason: String,
    /// Optional trailing data, e.g. the offending hash.
    pub data: Bytes,
}

/// A decoded P2P message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Addr(Vec<TimestampedAddress>),
    GetAddr,
    Inv(Vec<InventoryItem>),
    GetData(Vec<InventoryItem>),
    GetHeaders(BlockLocator),
    GetBlocks(BlockLocator),
    SendHeaders,
    Headers(Vec<BlockHeader>),
    Block(Block),
    Reject(Reject),
}

fn put_inventory(buf: &mut BytesMut, items: &[InventoryItem]) {
    put_compact_size(buf, items.len() as u64);
    for item in items {
        buf.put_u32_le(item.kind);
        buf.put_slice(&item.hash);
    }
}

fn get_inventory(buf: &mut Bytes) -> Result<Vec<InventoryItem>, WireError> {
    let count = get_compact_size(buf)?;
    if count > MAX_INV_ENTRIES {
        return Err(WireError::Malformed(format!("{count} inventory entries")));
    }
    let mut items = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        need(buf, 4)?;
        let kind = buf.get_u32_le();
        let hash = get_hash(buf)?;
        items.push(InventoryItem { kind, hash });
    }
    Ok(items)
}

impl Message {
    /// The wire command of this message.
    pub fn command(&self) -> Command {
        match self {
            Message::Version(_) => Command::Version,
            Message::Verack => Command::Verack,
            Message::Ping(_) => Command::Ping,
            Message::Pong(_) => Command::Pong,
            Message::Addr(_) => Command::Addr,
            Message::GetAddr => Command::GetAddr,
            Message::Inv(_) => Command::Inv,
            Message::GetData(_) => Command::GetData,
            Message::GetHeaders(_) => Command::GetHeaders,
            Message::GetBlocks(_) => Command::GetBlocks,
            Message::SendHeaders => Command::SendHeaders,
            Message::Headers(_) => Command::Headers,
            Message::Block(_) => Command::Block,
            Message::Reject(_) => Command::Reject,
        }
    }

    /// Serialize the payload alone, without the frame header.
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::Version(v) => v.encode_into(&mut buf),
            Message::Verack | Message::GetAddr | Message::SendHeaders => {}
            Message::Ping(nonce) | Message::Pong(nonce) => buf.put_u64_le(*nonce),
            Message::Addr(records) => {
                put_compact_size(&mut buf, records.len() as u64);
                for record in records {
                    buf.put_u32_le(record.time);
                    record.addr.encode_into(&mut buf);
                }
            }
            Message::Inv(items) | Message::GetData(items) => put_inventory(&mut buf, items),
            Message::GetHeaders(locator) | Message::GetBlocks(locator) => {
                locator.encode_into(&mut buf)
            }
            Message::Headers(headers) => {
                put_compact_size(&mut buf, headers.len() as u64);
                for header in headers {
                    header.encode_into(&mut buf);
                    // Trailing transaction count, always zero in `headers`.
                    put_compact_size(&mut buf, 0);
                }
            }
            Message::Block(block) => {
                block.header.encode_into(&mut buf);
                buf.put_slice(&block.txdata);
            }
            Message::Reject(reject) => {
                put_var_str(&mut buf, &reject.message);
                buf.put_u8(reject.code);
                put_var_str(&mut buf, &reject.reason);
                buf.put_slice(&reject.data);
            }
        }
        buf.freeze()
    }

    /// Decode a checksum-verified frame into a typed message.
    pub fn decode(frame: &RawFrame) -> Result<Message, WireError> {
        let mut buf = frame.payload.clone();
        match frame.command {
            Command::Version => Ok(Message::Version(VersionMessage::decode(&mut buf)?)),
            Command::Verack => Ok(Message::Verack),
            Command::Ping => {
                need(&buf, 8)?;
                Ok(Message::Ping(buf.get_u64_le()))
            }
            Command::Pong => {
                need(&buf, 8)?;
                Ok(Message::Pong(buf.get_u64_le()))
            }
            Command::Addr => {
                let count = get_compact_size(&mut buf)?;
                if count > MAX_ADDR_ENTRIES {
                    return Err(WireError::Malformed(format!("{count} addr records")));
                }
                let mut records = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    need(&buf, 4)?;
                    let time = buf.get_u32_le();
                    let addr = NetworkAddress::decode(&mut buf)?;
                    records.push(TimestampedAddress { time, addr });
                }
                Ok(Message::Addr(records))
            }
            Command::GetAddr => Ok(Message::GetAddr),
            Command::Inv => Ok(Message::Inv(get_inventory(&mut buf)?)),
            Command::GetData => Ok(Message::GetData(get_inventory(&mut buf)?)),
            Command::GetHeaders => Ok(Message::GetHeaders(BlockLocator::decode(&mut buf)?)),
            Command::GetBlocks => Ok(Message::GetBlocks(BlockLocator::decode(&mut buf)?)),
            Command::SendHeaders => Ok(Message::SendHeaders),
            Command::Headers => {
                let count = get_compact_size(&mut buf)?;
                if count > MAX_HEADERS_ENTRIES {
                    return Err(WireError::Malformed(format!("{count} headers")));
                }
                let mut headers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    headers.push(BlockHeader::decode(&mut buf)?);
                    let _tx_count = get_compact_size(&mut buf)?;
                }
                Ok(Message::Headers(headers))
            }
            Command::Block => {
                let header = BlockHeader::decode(&mut buf)?;
                Ok(Message::Block(Block {
                    header,
                    txdata: buf,
                }))
            }
            Command::Reject => {
                let message = get_var_str(&mut buf, MAX_REJECT_STRING_LEN)?;
                need(&buf, 1)?;
                let code = buf.get_u8();
                let reason = get_var_str(&mut buf, MAX_REJECT_STRING_LEN)?;
                Ok(Message::Reject(Reject {
                    message,
                    code,
                    reason,
                    data: buf,
                }))
            }
            Command::Unknown(_) => Err(WireError::UnknownCommand(frame.command.to_string())),
        }
    }
}

/// Serialize a complete frame: header plus payload.
pub fn encode_message(magic: [u8; 4], message: &Message) -> Bytes {
    let payload = message.encode_payload();
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&magic);
    buf.put_slice(&message.command().to_bytes());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload_checksum(&payload));
    buf.put_slice(&payload);
    buf.freeze()
}
