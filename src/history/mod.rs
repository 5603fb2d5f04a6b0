//! History engine: header and payload pipelines behind one façade.
//!
//! Headers and payloads are persisted with per-header indices (height,
//! cumulative chain score, best-chain markers, semantic-validity flags).
//! Appends produce [`ProgressInfo`] instructions that drive the state engine
//! through extensions and reorganizations. The header pipeline lives in
//! [`headers`], the payload pipeline in [`payloads`]; both share this store.

mod headers;
mod payloads;

use std::sync::Arc;

use primitive_types::U256;

use crate::config::ConsensusParams;
use crate::errors::{ChainError, ChainResult};
use crate::storage::VersionedStore;
use crate::types::{
    Block, BlockHeader, BlockPayload, Height, Modifier, ModifierId, SyncInfo, WireSerializable,
};

const HEADER_PREFIX: &[u8] = b"h:";
const PAYLOAD_PREFIX: &[u8] = b"p:";
const PAYLOAD_ID_PREFIX: &[u8] = b"pi:";
const SCORE_PREFIX: &[u8] = b"s:";
const HEIGHT_PREFIX: &[u8] = b"t:";
const CHILDREN_PREFIX: &[u8] = b"c:";
const VALIDITY_PREFIX: &[u8] = b"f:";
const BEST_MARKER_PREFIX: &[u8] = b"b:";
const HEIGHT_INDEX_PREFIX: &[u8] = b"hi:";
const BEST_HEADER_KEY: &[u8] = b"m:best_header";
const BEST_FULL_KEY: &[u8] = b"m:best_full";

const VALIDITY_VALID: u8 = 1;
const VALIDITY_INVALID: u8 = 2;

fn id_key(prefix: &[u8], id: &ModifierId) -> Vec<u8> {
    [prefix, id.as_bytes().as_slice()].concat()
}

fn height_index_key(height: Height) -> Vec<u8> {
    [HEIGHT_INDEX_PREFIX, height.to_be_bytes().as_slice()].concat()
}

/// Instructions for the state engine: roll the removed blocks back to the
/// branch point, then apply the new segment in order.
#[derive(Clone, Debug, Default)]
pub struct ProgressInfo {
    pub branch_point: Option<ModifierId>,
    pub to_remove: Vec<Block>,
    pub to_apply: Vec<Block>,
}

impl ProgressInfo {
    pub fn empty() -> Self {
        ProgressInfo::default()
    }

    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_apply.is_empty()
    }
}

/// Result of comparing a remote's sync info against our chain; the value
/// classifies the remote.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChainComparison {
    Equal,
    Younger,
    Older,
    Nonsense,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SemanticValidity {
    Valid,
    Invalid,
    Unknown,
    Absent,
}

pub struct History {
    store: Arc<VersionedStore>,
    params: ConsensusParams,
}

impl History {
    pub fn open(store: Arc<VersionedStore>, params: ConsensusParams) -> Self {
        History { store, params }
    }

    /// Appends a header or payload, returning the progress instructions for
    /// the state engine. Appending an already-known modifier is a no-op with
    /// empty progress.
    pub fn append(&mut self, modifier: &Modifier) -> ChainResult<ProgressInfo> {
        match modifier {
            Modifier::Header(header) => self.append_header(header),
            Modifier::Payload(payload) => self.append_payload(payload),
        }
    }

    pub fn applicable(&self, modifier: &Modifier) -> ChainResult<bool> {
        match modifier {
            Modifier::Header(header) => {
                let id = header.id();
                if self.contains_header(&id)? {
                    return Ok(false);
                }
                Ok(header.is_genesis() || self.contains_header(&header.parent_id)?)
            }
            Modifier::Payload(payload) => {
                if !self.contains_header(&payload.header_id)? {
                    return Ok(false);
                }
                Ok(self.payload_by_header(&payload.header_id)?.is_none())
            }
        }
    }

    pub fn contains_header(&self, id: &ModifierId) -> ChainResult<bool> {
        self.store.contains(&id_key(HEADER_PREFIX, id))
    }

    pub fn header_by_id(&self, id: &ModifierId) -> ChainResult<Option<BlockHeader>> {
        match self.store.get(&id_key(HEADER_PREFIX, id))? {
            Some(bytes) => Ok(Some(BlockHeader::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Payload attached to a header, looked up by the header id.
    pub fn payload_by_header(&self, header_id: &ModifierId) -> ChainResult<Option<BlockPayload>> {
        match self.store.get(&id_key(PAYLOAD_PREFIX, header_id))? {
            Some(bytes) => Ok(Some(BlockPayload::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Generic lookup by modifier id; a present id of the wrong kind simply
    /// resolves through its own kind.
    pub fn modifier_by_id(&self, id: &ModifierId) -> ChainResult<Option<Modifier>> {
        if let Some(header) = self.header_by_id(id)? {
            return Ok(Some(Modifier::Header(header)));
        }
        if let Some(header_id_bytes) = self.store.get(&id_key(PAYLOAD_ID_PREFIX, id))? {
            let header_id = ModifierId(header_id_bytes.as_slice().try_into().map_err(|_| {
                ChainError::Fatal("corrupt payload id index".into())
            })?);
            return Ok(self.payload_by_header(&header_id)?.map(Modifier::Payload));
        }
        Ok(None)
    }

    /// Header plus payload, when both are present.
    pub fn block_by_id(&self, id: &ModifierId) -> ChainResult<Option<Block>> {
        let Some(header) = self.header_by_id(id)? else {
            return Ok(None);
        };
        let Some(payload) = self.payload_by_header(id)? else {
            return Ok(None);
        };
        Ok(Some(Block::new(header, payload)))
    }

    pub fn is_full(&self, id: &ModifierId) -> ChainResult<bool> {
        Ok(self.contains_header(id)? && self.store.contains(&id_key(PAYLOAD_PREFIX, id))?)
    }

    pub fn score_of(&self, id: &ModifierId) -> ChainResult<Option<U256>> {
        match self.store.get(&id_key(SCORE_PREFIX, id))? {
            Some(bytes) => {
                if bytes.len() != 32 {
                    return Err(ChainError::Fatal("corrupt chain score record".into()));
                }
                Ok(Some(U256::from_big_endian(&bytes)))
            }
            None => Ok(None),
        }
    }

    pub fn height_of(&self, id: &ModifierId) -> ChainResult<Option<Height>> {
        match self.store.get(&id_key(HEIGHT_PREFIX, id))? {
            Some(bytes) => Ok(Some(i32::from_le_bytes(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Fatal("corrupt height record".into()))?,
            ))),
            None => Ok(None),
        }
    }

    pub fn children_of(&self, id: &ModifierId) -> ChainResult<Vec<ModifierId>> {
        match self.store.get(&id_key(CHILDREN_PREFIX, id))? {
            Some(bytes) => {
                let raw: Vec<[u8; 32]> = bincode::deserialize(&bytes)?;
                Ok(raw.into_iter().map(ModifierId).collect())
            }
            None => Ok(Vec::new()),
        }
    }

    pub fn headers_at_height(&self, height: Height) -> ChainResult<Vec<ModifierId>> {
        match self.store.get(&height_index_key(height))? {
            Some(bytes) => {
                let raw: Vec<[u8; 32]> = bincode::deserialize(&bytes)?;
                Ok(raw.into_iter().map(ModifierId).collect())
            }
            None => Ok(Vec::new()),
        }
    }

    pub fn best_header_id(&self) -> ChainResult<Option<ModifierId>> {
        self.read_id(BEST_HEADER_KEY)
    }

    pub fn best_full_id(&self) -> ChainResult<Option<ModifierId>> {
        self.read_id(BEST_FULL_KEY)
    }

    fn read_id(&self, key: &[u8]) -> ChainResult<Option<ModifierId>> {
        match self.store.get(key)? {
            Some(bytes) => Ok(Some(ModifierId(bytes.as_slice().try_into().map_err(
                |_| ChainError::Fatal("corrupt best pointer".into()),
            )?))),
            None => Ok(None),
        }
    }

    pub fn best_header(&self) -> ChainResult<Option<BlockHeader>> {
        match self.best_header_id()? {
            Some(id) => self.header_by_id(&id),
            None => Ok(None),
        }
    }

    pub fn best_height(&self) -> ChainResult<Height> {
        match self.best_header_id()? {
            Some(id) => Ok(self.height_of(&id)?.unwrap_or(-1)),
            None => Ok(-1),
        }
    }

    pub fn is_on_best_chain(&self, id: &ModifierId) -> ChainResult<bool> {
        self.store.contains(&id_key(BEST_MARKER_PREFIX, id))
    }

    pub fn is_semantically_valid(&self, id: &ModifierId) -> ChainResult<SemanticValidity> {
        match self.store.get(&id_key(VALIDITY_PREFIX, id))? {
            Some(bytes) if bytes.first() == Some(&VALIDITY_VALID) => Ok(SemanticValidity::Valid),
            Some(bytes) if bytes.first() == Some(&VALIDITY_INVALID) => {
                Ok(SemanticValidity::Invalid)
            }
            Some(_) => Err(ChainError::Fatal("corrupt validity flag".into())),
            None => {
                if self.contains_header(id)? {
                    Ok(SemanticValidity::Unknown)
                } else {
                    Ok(SemanticValidity::Absent)
                }
            }
        }
    }

    /// Records a block as semantically valid after a successful state apply.
    pub fn mark_valid(&mut self, id: &ModifierId) -> ChainResult<()> {
        self.store.put_unversioned(
            &[(id_key(VALIDITY_PREFIX, id), vec![VALIDITY_VALID])],
            &[],
        )
    }

    /// Ancestor walk: ids from `tip` down to genesis, genesis first.
    pub fn chain_from_genesis(&self, tip: &ModifierId) -> ChainResult<Vec<ModifierId>> {
        let mut ids = Vec::new();
        let mut cursor = *tip;
        loop {
            let header = self.header_by_id(&cursor)?.ok_or_else(|| {
                ChainError::Fatal(format!("chain walk hit unknown header {cursor}"))
            })?;
            ids.push(cursor);
            if header.is_genesis() {
                break;
            }
            cursor = header.parent_id;
        }
        ids.reverse();
        Ok(ids)
    }

    /// The last `count` ids of the best header chain, oldest first.
    pub fn last_header_ids(&self, count: usize) -> ChainResult<Vec<ModifierId>> {
        match self.best_header_id()? {
            None => Ok(Vec::new()),
            Some(tip) => {
                let chain = self.chain_from_genesis(&tip)?;
                let start = chain.len().saturating_sub(count);
                Ok(chain[start..].to_vec())
            }
        }
    }

    pub fn sync_info(&self, answer: bool) -> ChainResult<SyncInfo> {
        Ok(SyncInfo::new(
            answer,
            self.last_header_ids(self.params.sync_info_len)?,
        ))
    }

    /// Classifies the remote node behind `remote` relative to our chain.
    pub fn compare(&self, remote: &SyncInfo) -> ChainResult<ChainComparison> {
        let our_best = self.best_header_id()?;
        if remote.is_empty() {
            return Ok(if our_best.is_none() {
                ChainComparison::Equal
            } else {
                ChainComparison::Younger
            });
        }
        let Some(our_best) = our_best else {
            // They have history and we have none; they are the elder chain.
            return Ok(ChainComparison::Older);
        };
        let remote_tip = *remote.tip().expect("non-empty sync info");
        if remote_tip == our_best {
            return Ok(ChainComparison::Equal);
        }
        if self.is_on_best_chain(&remote_tip)? {
            return Ok(ChainComparison::Older);
        }
        for id in remote.last_header_ids.iter().rev() {
            if self.contains_header(id)? {
                return Ok(ChainComparison::Younger);
            }
        }
        Ok(ChainComparison::Nonsense)
    }

    /// Header ids the remote should download next, at most `size` of them.
    pub fn continuation_ids(
        &self,
        remote: &SyncInfo,
        size: usize,
    ) -> ChainResult<Option<Vec<ModifierId>>> {
        let Some(best) = self.best_header_id()? else {
            // We are empty; echo the remote's starting points.
            return Ok(Some(remote.last_header_ids.clone()));
        };
        let chain = self.chain_from_genesis(&best)?;
        if remote.is_empty() {
            return Ok(Some(chain.into_iter().take(size).collect()));
        }
        let anchor = remote
            .last_header_ids
            .iter()
            .rev()
            .find_map(|id| chain.iter().position(|ours| ours == id));
        match anchor {
            Some(position) => Ok(Some(
                chain[position + 1..].iter().take(size).copied().collect(),
            )),
            None => Ok(None),
        }
    }

    /// All maximal forward chains from `header` through known headers.
    pub fn continuation_header_chains(
        &self,
        header: &BlockHeader,
    ) -> ChainResult<Vec<Vec<BlockHeader>>> {
        let mut chains = Vec::new();
        let mut stack: Vec<Vec<BlockHeader>> = vec![vec![header.clone()]];
        while let Some(chain) = stack.pop() {
            let tip = chain.last().expect("non-empty chain");
            let children = self.children_of(&tip.id())?;
            if children.is_empty() {
                chains.push(chain);
                continue;
            }
            for child in children {
                let Some(child_header) = self.header_by_id(&child)? else {
                    continue;
                };
                let mut extended = chain.clone();
                extended.push(child_header);
                stack.push(extended);
            }
        }
        Ok(chains)
    }

    /// Lowest common ancestor of two known headers.
    fn common_ancestor(&self, a: &ModifierId, b: &ModifierId) -> ChainResult<ModifierId> {
        let mut a_cursor = *a;
        let mut b_cursor = *b;
        let mut a_height = self
            .height_of(&a_cursor)?
            .ok_or_else(|| ChainError::Fatal("lca walk hit unknown header".into()))?;
        let mut b_height = self
            .height_of(&b_cursor)?
            .ok_or_else(|| ChainError::Fatal("lca walk hit unknown header".into()))?;
        while a_height > b_height {
            a_cursor = self.parent_of(&a_cursor)?;
            a_height -= 1;
        }
        while b_height > a_height {
            b_cursor = self.parent_of(&b_cursor)?;
            b_height -= 1;
        }
        while a_cursor != b_cursor {
            a_cursor = self.parent_of(&a_cursor)?;
            b_cursor = self.parent_of(&b_cursor)?;
        }
        Ok(a_cursor)
    }

    fn parent_of(&self, id: &ModifierId) -> ChainResult<ModifierId> {
        let header = self
            .header_by_id(id)?
            .ok_or_else(|| ChainError::Fatal(format!("parent walk hit unknown header {id}")))?;
        if header.is_genesis() {
            return Err(ChainError::Fatal("parent walk passed genesis".into()));
        }
        Ok(header.parent_id)
    }

    /// Ids strictly between `ancestor` (exclusive) and `tip` (inclusive),
    /// oldest first.
    fn segment_above(
        &self,
        ancestor: &ModifierId,
        tip: &ModifierId,
    ) -> ChainResult<Vec<ModifierId>> {
        let mut segment = Vec::new();
        let mut cursor = *tip;
        while cursor != *ancestor {
            segment.push(cursor);
            let header = self.header_by_id(&cursor)?.ok_or_else(|| {
                ChainError::Fatal(format!("segment walk hit unknown header {cursor}"))
            })?;
            if header.is_genesis() {
                return Err(ChainError::Fatal(
                    "segment walk passed genesis without meeting ancestor".into(),
                ));
            }
            cursor = header.parent_id;
        }
        segment.reverse();
        Ok(segment)
    }

    fn block_or_fatal(&self, id: &ModifierId) -> ChainResult<Block> {
        self.block_by_id(id)?.ok_or_else(|| {
            ChainError::Fatal(format!("expected full block {id} is not stored"))
        })
    }
}

#[cfg(test)]
pub(crate) mod tests;
