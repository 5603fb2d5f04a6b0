//! Semantic types shared across the node: modifier identifiers, state
//! digests, heights, and the byte-level codec helpers every wire format is
//! written with.

pub mod block;
pub mod boxes;
pub mod header;
pub mod sync_info;
pub mod transaction;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

pub use block::{Block, BlockPayload, Modifier};
pub use boxes::{AssetBox, BoxId, ChainBox, CoinbaseBox, Proposition, PubKeyInfoBox, TokenId};
pub use header::BlockHeader;
pub use sync_info::SyncInfo;
pub use transaction::{Directive, Transaction, Unlocker};

/// Block height. Genesis sits at 0; the state before genesis reports -1.
pub type Height = i32;

pub const PRE_GENESIS_HEIGHT: Height = -1;
pub const GENESIS_HEIGHT: Height = 0;

/// Content hash identifying a header or payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModifierId(pub [u8; 32]);

impl ModifierId {
    pub const SIZE: usize = 32;

    pub fn zero() -> Self {
        ModifierId([0u8; 32])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for ModifierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ModifierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModifierId({})", hex::encode(&self.0[..8]))
    }
}

/// Identifier of a committed state version: the id of the block that
/// produced it.
pub type VersionTag = ModifierId;

/// Authenticated-dictionary root: 32-byte root label plus the tree height.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AdDigest {
    pub root: [u8; 32],
    pub tree_height: u8,
}

impl AdDigest {
    pub const SIZE: usize = 33;

    pub fn empty() -> Self {
        AdDigest {
            root: [0u8; 32],
            tree_height: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; 33] {
        let mut out = [0u8; 33];
        out[..32].copy_from_slice(&self.root);
        out[32] = self.tree_height;
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> ChainResult<Self> {
        if bytes.len() != Self::SIZE {
            return Err(ChainError::Malformed("bad AD digest length".into()));
        }
        let mut root = [0u8; 32];
        root.copy_from_slice(&bytes[..32]);
        Ok(AdDigest {
            root,
            tree_height: bytes[32],
        })
    }
}

impl fmt::Display for AdDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.root), self.tree_height)
    }
}

/// Fixed-field-order binary codec every network object implements.
pub trait WireSerializable: Sized {
    fn write_to(&self, out: &mut Vec<u8>);

    fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }

    fn from_bytes(bytes: &[u8]) -> ChainResult<Self> {
        let mut reader = ByteReader::new(bytes);
        let value = Self::read_from(&mut reader)?;
        if !reader.is_empty() {
            return Err(ChainError::Malformed("trailing bytes after modifier".into()));
        }
        Ok(value)
    }
}

/// Cursor over a byte slice with bounds-checked reads.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> ChainResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(ChainError::Malformed("unexpected end of input".into()));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> ChainResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32_le(&mut self) -> ChainResult<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("sized slice");
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_i32_le(&mut self) -> ChainResult<i32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("sized slice");
        Ok(i32::from_le_bytes(bytes))
    }

    pub fn read_u64_le(&mut self) -> ChainResult<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("sized slice");
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_array<const N: usize>(&mut self) -> ChainResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_bytes(&mut self, len: usize) -> ChainResult<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    /// LEB128 with a 10-byte ceiling.
    pub fn read_varint(&mut self) -> ChainResult<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(ChainError::Malformed("varint overflow".into()));
            }
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }
}

pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Wall-clock unix time in milliseconds, the unit all chain timestamps use.
pub fn unix_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Merkle root over 32-byte leaves; odd nodes are paired with themselves.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    use crate::crypto::{hash256, hash_parts};
    if leaves.is_empty() {
        return hash256(b"cinder.empty");
    }
    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for chunk in level.chunks(2) {
            let left = chunk[0];
            let right = if chunk.len() == 2 { chunk[1] } else { chunk[0] };
            next.push(hash_parts(&[&left, &right]));
        }
        level = next;
    }
    level[0]
}
