//! Header pipeline: syntactic and contextual validation, score indexing,
//! and best-header-chain selection.

use std::collections::HashSet;

use primitive_types::U256;
use tracing::{debug, info};

use crate::difficulty::required_difficulty_after;
use crate::errors::{ChainError, ChainResult};
use crate::types::{unix_millis, BlockHeader, ModifierId, WireSerializable};

use super::{
    height_index_key, id_key, History, ProgressInfo, BEST_HEADER_KEY, BEST_MARKER_PREFIX,
    CHILDREN_PREFIX, HEADER_PREFIX, HEIGHT_PREFIX, SCORE_PREFIX,
};

impl History {
    pub(super) fn append_header(&mut self, header: &BlockHeader) -> ChainResult<ProgressInfo> {
        let id = header.id();
        if self.contains_header(&id)? {
            return Ok(ProgressInfo::empty());
        }
        header.syntactic_validity()?;

        let parent_score = if header.is_genesis() {
            if header.difficulty != self.params.initial_difficulty() {
                return Err(ChainError::SemanticInvalid(
                    "genesis difficulty differs from protocol initial target".into(),
                ));
            }
            U256::zero()
        } else {
            let parent = self.header_by_id(&header.parent_id)?.ok_or_else(|| {
                ChainError::NotApplicable(format!("unknown parent {}", header.parent_id))
            })?;
            if header.height != parent.height + 1 {
                return Err(ChainError::Malformed(format!(
                    "height {} does not follow parent height {}",
                    header.height, parent.height
                )));
            }
            if header.timestamp <= parent.timestamp {
                return Err(ChainError::SemanticInvalid(
                    "timestamp not after parent".into(),
                ));
            }
            if header.timestamp > unix_millis() + self.params.max_time_skew_ms {
                return Err(ChainError::SemanticInvalid(
                    "timestamp too far in the future".into(),
                ));
            }
            let expected =
                required_difficulty_after(&parent, &self.params, |pid| self.header_by_id(pid))?;
            if header.difficulty != expected {
                return Err(ChainError::SemanticInvalid(
                    "difficulty does not match recomputed target".into(),
                ));
            }
            self.score_of(&header.parent_id)?
                .ok_or_else(|| ChainError::Fatal("parent header has no chain score".into()))?
        };
        let score = parent_score
            .checked_add(header.work())
            .unwrap_or(U256::MAX);

        let mut inserts: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        inserts.push((id_key(HEADER_PREFIX, &id), header.to_bytes()));
        let mut score_bytes = [0u8; 32];
        score.to_big_endian(&mut score_bytes);
        inserts.push((id_key(SCORE_PREFIX, &id), score_bytes.to_vec()));
        inserts.push((
            id_key(HEIGHT_PREFIX, &id),
            header.height.to_le_bytes().to_vec(),
        ));

        let mut at_height: Vec<[u8; 32]> = self
            .headers_at_height(header.height)?
            .into_iter()
            .map(|m| m.0)
            .collect();
        at_height.push(id.0);
        inserts.push((
            height_index_key(header.height),
            bincode::serialize(&at_height)?,
        ));

        if !header.is_genesis() {
            let mut siblings: Vec<[u8; 32]> = self
                .children_of(&header.parent_id)?
                .into_iter()
                .map(|m| m.0)
                .collect();
            siblings.push(id.0);
            inserts.push((
                id_key(CHILDREN_PREFIX, &header.parent_id),
                bincode::serialize(&siblings)?,
            ));
        }

        self.store.commit(id, &inserts, &[])?;
        debug!(%id, height = header.height, "header stored");

        match self.best_header_id()? {
            None => self.switch_best_header(&id)?,
            Some(best_id) if best_id == header.parent_id => {
                // Plain extension of the best chain.
                self.store.put_unversioned(
                    &[
                        (id_key(BEST_MARKER_PREFIX, &id), vec![1]),
                        (BEST_HEADER_KEY.to_vec(), id.as_bytes().to_vec()),
                    ],
                    &[],
                )?;
            }
            Some(best_id) => {
                let best_score = self
                    .score_of(&best_id)?
                    .ok_or_else(|| ChainError::Fatal("best header has no chain score".into()))?;
                // Strictly greater score switches; ties keep the incumbent.
                if score > best_score {
                    info!(new = %id, old = %best_id, "best header chain switched");
                    self.switch_best_header(&id)?;
                }
            }
        }
        Ok(ProgressInfo::empty())
    }

    /// Atomically moves every best-chain marker from the current best chain
    /// to the chain ending at `new_tip`.
    pub(super) fn switch_best_header(&mut self, new_tip: &ModifierId) -> ChainResult<()> {
        let new_chain = self.chain_from_genesis(new_tip)?;
        let new_set: HashSet<ModifierId> = new_chain.iter().copied().collect();

        let mut removes: Vec<Vec<u8>> = Vec::new();
        if let Some(old_tip) = self.best_header_id()? {
            for id in self.chain_from_genesis(&old_tip)? {
                if !new_set.contains(&id) {
                    removes.push(id_key(BEST_MARKER_PREFIX, &id));
                }
            }
        }
        let mut inserts: Vec<(Vec<u8>, Vec<u8>)> = new_chain
            .iter()
            .map(|id| (id_key(BEST_MARKER_PREFIX, id), vec![1]))
            .collect();
        inserts.push((BEST_HEADER_KEY.to_vec(), new_tip.as_bytes().to_vec()));
        self.store.put_unversioned(&inserts, &removes)
    }
}
