//! Full blocks and the modifier sum type fed into the history engine.

use crate::errors::{ChainError, ChainResult};
use crate::types::header::BlockHeader;
use crate::types::transaction::Transaction;
use crate::types::{merkle_root, ByteReader, ModifierId, WireSerializable, write_varint};
use crate::crypto::hash256;

pub const HEADER_MODIFIER_TYPE: u8 = 101;
pub const PAYLOAD_MODIFIER_TYPE: u8 = 102;

/// Ordered transactions of one block, keyed back to their header.
#[derive(Clone, PartialEq, Debug)]
pub struct BlockPayload {
    pub header_id: ModifierId,
    pub transactions: Vec<Transaction>,
}

impl BlockPayload {
    pub fn new(header_id: ModifierId, transactions: Vec<Transaction>) -> Self {
        BlockPayload {
            header_id,
            transactions,
        }
    }

    pub fn id(&self) -> ModifierId {
        ModifierId(hash256(&self.to_bytes()))
    }

    /// Merkle root over transaction ids, committed in the header.
    pub fn transactions_root(&self) -> [u8; 32] {
        let leaves: Vec<[u8; 32]> = self.transactions.iter().map(|tx| tx.id().0).collect();
        merkle_root(&leaves)
    }

    pub fn serialized_size(&self) -> usize {
        self.to_bytes().len()
    }
}

impl WireSerializable for BlockPayload {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.header_id.as_bytes());
        write_varint(out, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.write_to(out);
        }
    }

    fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let header_id = ModifierId(reader.read_array::<32>()?);
        let count = reader.read_varint()? as usize;
        let mut transactions = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            transactions.push(Transaction::read_from(reader)?);
        }
        Ok(BlockPayload {
            header_id,
            transactions,
        })
    }
}

/// Header plus its payload; the unit the state engine applies.
#[derive(Clone, PartialEq, Debug)]
pub struct Block {
    pub header: BlockHeader,
    pub payload: BlockPayload,
}

impl Block {
    pub fn new(header: BlockHeader, payload: BlockPayload) -> Self {
        Block { header, payload }
    }

    pub fn id(&self) -> ModifierId {
        self.header.id()
    }

    pub fn height(&self) -> i32 {
        self.header.height
    }

    /// Structural agreement between header and payload: back-reference,
    /// transactions root, and the one-coinbase rule.
    pub fn validate_structure(&self) -> ChainResult<()> {
        if self.payload.header_id != self.header.id() {
            return Err(ChainError::Malformed(
                "payload does not reference this header".into(),
            ));
        }
        if self.payload.transactions_root() != self.header.transactions_root {
            return Err(ChainError::SemanticInvalid(
                "transactions root mismatch".into(),
            ));
        }
        let coinbase_count = self
            .payload
            .transactions
            .iter()
            .filter(|tx| tx.has_coinbase_directive())
            .count();
        if coinbase_count != 1 {
            return Err(ChainError::SemanticInvalid(format!(
                "expected exactly one coinbase transaction, found {coinbase_count}"
            )));
        }
        if !self
            .payload
            .transactions
            .last()
            .map(Transaction::has_coinbase_directive)
            .unwrap_or(false)
        {
            return Err(ChainError::SemanticInvalid(
                "coinbase must be the final transaction".into(),
            ));
        }
        Ok(())
    }
}

/// What arrives from the network or the miner: a header or a payload.
#[derive(Clone, PartialEq, Debug)]
pub enum Modifier {
    Header(BlockHeader),
    Payload(BlockPayload),
}

impl Modifier {
    pub fn id(&self) -> ModifierId {
        match self {
            Modifier::Header(h) => h.id(),
            Modifier::Payload(p) => p.id(),
        }
    }

    pub fn type_id(&self) -> u8 {
        match self {
            Modifier::Header(_) => HEADER_MODIFIER_TYPE,
            Modifier::Payload(_) => PAYLOAD_MODIFIER_TYPE,
        }
    }
}
