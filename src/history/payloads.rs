//! Payload pipeline: attaching payloads to headers, tracking the best fully
//! validated chain, and producing progress instructions for the state.

use primitive_types::U256;
use tracing::{info, warn};

use crate::errors::{ChainError, ChainResult};
use crate::types::{Block, BlockHeader, BlockPayload, ModifierId, WireSerializable};

use super::{
    id_key, History, ProgressInfo, SemanticValidity, BEST_FULL_KEY, BEST_HEADER_KEY,
    BEST_MARKER_PREFIX, HEADER_PREFIX, PAYLOAD_ID_PREFIX, PAYLOAD_PREFIX, VALIDITY_INVALID,
    VALIDITY_PREFIX,
};

impl History {
    pub(super) fn append_payload(&mut self, payload: &BlockPayload) -> ChainResult<ProgressInfo> {
        let header_id = payload.header_id;
        let header = self.header_by_id(&header_id)?.ok_or_else(|| {
            ChainError::NotApplicable(format!("payload for unknown header {header_id}"))
        })?;
        if self.payload_by_header(&header_id)?.is_some() {
            return Ok(ProgressInfo::empty());
        }
        if payload.serialized_size() > self.params.max_block_size {
            return Err(ChainError::SemanticInvalid(format!(
                "payload of {} bytes exceeds block size limit",
                payload.serialized_size()
            )));
        }
        let block = Block::new(header.clone(), payload.clone());
        block.validate_structure()?;

        let payload_id = payload.id();
        let inserts = vec![
            (id_key(PAYLOAD_PREFIX, &header_id), payload.to_bytes()),
            (
                id_key(PAYLOAD_ID_PREFIX, &payload_id),
                header_id.as_bytes().to_vec(),
            ),
        ];
        self.store.commit(payload_id, &inserts, &[])?;

        self.progress_for_new_payload(&header)
    }

    /// Recomputes the best fully applied chain after `header` gained its
    /// payload, and emits the instructions taking the state there.
    fn progress_for_new_payload(&mut self, header: &BlockHeader) -> ChainResult<ProgressInfo> {
        let header_id = header.id();
        if !self.ancestry_full(&header_id)? {
            // A gap below; this payload waits for its prerequisites.
            return Ok(ProgressInfo::empty());
        }
        let tip = self.best_full_descendant(header)?;
        let current = self.best_full_id()?;

        let progress = match current {
            None => {
                let to_apply = self.blocks_for(&self.chain_from_genesis(&tip)?)?;
                ProgressInfo {
                    branch_point: None,
                    to_remove: Vec::new(),
                    to_apply,
                }
            }
            Some(current) if current == tip => return Ok(ProgressInfo::empty()),
            Some(current) => {
                let tip_score = self.score_or_fatal(&tip)?;
                let current_score = self.score_or_fatal(&current)?;
                if tip_score <= current_score {
                    return Ok(ProgressInfo::empty());
                }
                let ancestor = self.common_ancestor(&tip, &current)?;
                if ancestor == current {
                    ProgressInfo {
                        branch_point: None,
                        to_remove: Vec::new(),
                        to_apply: self.blocks_for(&self.segment_above(&ancestor, &tip)?)?,
                    }
                } else {
                    let mut to_remove =
                        self.blocks_for(&self.segment_above(&ancestor, &current)?)?;
                    to_remove.reverse();
                    info!(
                        branch_point = %ancestor,
                        dropped = to_remove.len(),
                        "chain reorganization"
                    );
                    ProgressInfo {
                        branch_point: Some(ancestor),
                        to_remove,
                        to_apply: self.blocks_for(&self.segment_above(&ancestor, &tip)?)?,
                    }
                }
            }
        };
        self.store.put_unversioned(
            &[(BEST_FULL_KEY.to_vec(), tip.as_bytes().to_vec())],
            &[],
        )?;
        Ok(progress)
    }

    /// True when every block from `id` down to genesis has a payload and is
    /// not marked semantically invalid.
    fn ancestry_full(&self, id: &ModifierId) -> ChainResult<bool> {
        let mut cursor = *id;
        loop {
            if !self.is_full(&cursor)? {
                return Ok(false);
            }
            if self.is_semantically_valid(&cursor)? == SemanticValidity::Invalid {
                return Ok(false);
            }
            let header = self
                .header_by_id(&cursor)?
                .ok_or_else(|| ChainError::Fatal("ancestry walk hit unknown header".into()))?;
            if header.is_genesis() {
                return Ok(true);
            }
            cursor = header.parent_id;
        }
    }

    /// Highest-score tip reachable from `from` through full, not-invalid
    /// headers; `from` itself qualifies by construction.
    fn best_full_descendant(&self, from: &BlockHeader) -> ChainResult<ModifierId> {
        let mut best = from.id();
        let mut best_score = self.score_or_fatal(&best)?;
        let mut stack = vec![from.id()];
        while let Some(id) = stack.pop() {
            for child in self.children_of(&id)? {
                if !self.is_full(&child)? {
                    continue;
                }
                if self.is_semantically_valid(&child)? == SemanticValidity::Invalid {
                    continue;
                }
                let score = self.score_or_fatal(&child)?;
                if score > best_score {
                    best = child;
                    best_score = score;
                }
                stack.push(child);
            }
        }
        Ok(best)
    }

    fn score_or_fatal(&self, id: &ModifierId) -> ChainResult<U256> {
        self.score_of(id)?
            .ok_or_else(|| ChainError::Fatal(format!("missing chain score for {id}")))
    }

    fn blocks_for(&self, ids: &[ModifierId]) -> ChainResult<Vec<Block>> {
        ids.iter().map(|id| self.block_or_fatal(id)).collect()
    }

    /// Marks `id` and every descendant semantically invalid, demotes the
    /// best pointers to the best remaining valid chain, and returns the
    /// instructions moving the state from `state_tip` onto it.
    pub fn report_invalid(
        &mut self,
        id: &ModifierId,
        state_tip: Option<ModifierId>,
    ) -> ChainResult<ProgressInfo> {
        if !self.contains_header(id)? {
            return Err(ChainError::NotApplicable(format!(
                "cannot invalidate unknown modifier {id}"
            )));
        }
        warn!(%id, "marking modifier and descendants semantically invalid");

        let mut tainted = Vec::new();
        let mut stack = vec![*id];
        while let Some(cursor) = stack.pop() {
            tainted.push(cursor);
            stack.extend(self.children_of(&cursor)?);
        }
        let flag_inserts: Vec<(Vec<u8>, Vec<u8>)> = tainted
            .iter()
            .map(|t| (id_key(VALIDITY_PREFIX, t), vec![VALIDITY_INVALID]))
            .collect();
        self.store.put_unversioned(&flag_inserts, &[])?;

        // Recompute the best header chain over the surviving headers.
        let survivors = self.surviving_tips()?;
        match survivors.header_tip {
            Some(tip) => self.switch_best_header(&tip)?,
            None => self.clear_best_markers()?,
        }
        let new_full = survivors.full_tip;
        match new_full {
            Some(tip) => self.store.put_unversioned(
                &[(BEST_FULL_KEY.to_vec(), tip.as_bytes().to_vec())],
                &[],
            )?,
            None => self
                .store
                .put_unversioned(&[], &[BEST_FULL_KEY.to_vec()])?,
        }

        let Some(target) = new_full else {
            return Ok(ProgressInfo::empty());
        };
        self.progress_between(state_tip, &target)
    }

    /// Instructions moving a state sitting at `from` onto the chain ending
    /// at `to`.
    pub fn progress_between(
        &self,
        from: Option<ModifierId>,
        to: &ModifierId,
    ) -> ChainResult<ProgressInfo> {
        let Some(from) = from else {
            return Ok(ProgressInfo {
                branch_point: None,
                to_remove: Vec::new(),
                to_apply: self.blocks_for(&self.chain_from_genesis(to)?)?,
            });
        };
        if from == *to {
            return Ok(ProgressInfo::empty());
        }
        let ancestor = self.common_ancestor(&from, to)?;
        if ancestor == from {
            return Ok(ProgressInfo {
                branch_point: None,
                to_remove: Vec::new(),
                to_apply: self.blocks_for(&self.segment_above(&ancestor, to)?)?,
            });
        }
        let mut to_remove = self.blocks_for(&self.segment_above(&ancestor, &from)?)?;
        to_remove.reverse();
        Ok(ProgressInfo {
            branch_point: Some(ancestor),
            to_remove,
            to_apply: self.blocks_for(&self.segment_above(&ancestor, to)?)?,
        })
    }

    fn clear_best_markers(&mut self) -> ChainResult<()> {
        let mut removes = vec![BEST_HEADER_KEY.to_vec()];
        if let Some(old) = self.best_header_id()? {
            for ancestor in self.chain_from_genesis(&old)? {
                removes.push(id_key(BEST_MARKER_PREFIX, &ancestor));
            }
        }
        self.store.put_unversioned(&[], &removes)
    }

    fn surviving_tips(&self) -> ChainResult<SurvivingTips> {
        let mut header_tip: Option<(U256, ModifierId)> = None;
        let mut full_tip: Option<(U256, ModifierId)> = None;
        for (key, _) in self.store.prefix_scan(HEADER_PREFIX)? {
            let id_bytes = &key[HEADER_PREFIX.len()..];
            let id = ModifierId(
                id_bytes
                    .try_into()
                    .map_err(|_| ChainError::Fatal("corrupt header key".into()))?,
            );
            if self.is_semantically_valid(&id)? == SemanticValidity::Invalid {
                continue;
            }
            let score = self.score_or_fatal(&id)?;
            if header_tip.map_or(true, |(best, _)| score > best) {
                header_tip = Some((score, id));
            }
            if self.ancestry_full(&id)? && full_tip.map_or(true, |(best, _)| score > best) {
                full_tip = Some((score, id));
            }
        }
        Ok(SurvivingTips {
            header_tip: header_tip.map(|(_, id)| id),
            full_tip: full_tip.map(|(_, id)| id),
        })
    }
}

struct SurvivingTips {
    header_tip: Option<ModifierId>,
    full_tip: Option<ModifierId>,
}
