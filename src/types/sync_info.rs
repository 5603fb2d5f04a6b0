//! Peer-sync summary: the last ids along a node's best header chain.

use crate::errors::{ChainError, ChainResult};
use crate::types::{ByteReader, ModifierId, WireSerializable, write_varint};

/// Upper bound on carried ids; messages above it are malformed.
pub const MAX_SYNC_INFO_LEN: usize = 1000;

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct SyncInfo {
    /// Set when this message answers a remote's sync request.
    pub answer: bool,
    /// Oldest first; the last entry is the sender's best header id.
    pub last_header_ids: Vec<ModifierId>,
}

impl SyncInfo {
    pub fn new(answer: bool, last_header_ids: Vec<ModifierId>) -> Self {
        SyncInfo {
            answer,
            last_header_ids,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_header_ids.is_empty()
    }

    pub fn tip(&self) -> Option<&ModifierId> {
        self.last_header_ids.last()
    }
}

impl WireSerializable for SyncInfo {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(u8::from(self.answer));
        write_varint(out, self.last_header_ids.len() as u64);
        for id in &self.last_header_ids {
            out.extend_from_slice(id.as_bytes());
        }
    }

    fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let answer = match reader.read_u8()? {
            0 => false,
            1 => true,
            other => {
                return Err(ChainError::Malformed(format!(
                    "invalid sync answer flag {other}"
                )))
            }
        };
        let count = reader.read_varint()? as usize;
        if count > MAX_SYNC_INFO_LEN {
            return Err(ChainError::Malformed(format!(
                "sync info carries {count} ids, limit is {MAX_SYNC_INFO_LEN}"
            )));
        }
        let mut last_header_ids = Vec::with_capacity(count);
        for _ in 0..count {
            last_header_ids.push(ModifierId(reader.read_array::<32>()?));
        }
        Ok(SyncInfo {
            answer,
            last_header_ids,
        })
    }
}
