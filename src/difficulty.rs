//! Difficulty retargeting.
//!
//! Targets are ceilings: a higher target is easier. Every `epoch_length`
//! blocks the target is rescaled by the ratio of observed to desired epoch
//! duration, clamped to a 4x move per step.

use primitive_types::{U256, U512};

use crate::config::ConsensusParams;
use crate::errors::{ChainError, ChainResult};
use crate::types::{BlockHeader, ModifierId};

const MAX_ADJUSTMENT_FACTOR: u64 = 4;

/// Target required for the block following `parent`. `lookup` resolves a
/// header by id; it must at least cover the current retarget window.
pub fn required_difficulty_after<F>(
    parent: &BlockHeader,
    params: &ConsensusParams,
    lookup: F,
) -> ChainResult<U256>
where
    F: Fn(&ModifierId) -> ChainResult<Option<BlockHeader>>,
{
    let epoch = u64::from(params.epoch_length.max(1));
    let next_height = parent.height as u64 + 1;
    if next_height % epoch != 0 || next_height < epoch {
        return Ok(parent.difficulty);
    }

    // Walk back to the first block of the closing epoch.
    let mut cursor = parent.clone();
    for _ in 0..epoch - 1 {
        let parent_id = cursor.parent_id;
        cursor = lookup(&parent_id)?.ok_or_else(|| {
            ChainError::NotApplicable(format!(
                "retarget window broken: missing header {parent_id}"
            ))
        })?;
    }

    let observed_ms = parent.timestamp.saturating_sub(cursor.timestamp).max(1);
    let expected_ms = params.block_interval_secs * 1_000 * (epoch - 1).max(1);

    let scaled = U512::from(parent.difficulty) * U512::from(observed_ms) / U512::from(expected_ms);
    let unclamped = U256::try_from(scaled).unwrap_or(U256::MAX);

    let ceiling = parent
        .difficulty
        .checked_mul(U256::from(MAX_ADJUSTMENT_FACTOR))
        .unwrap_or(U256::MAX);
    let floor = (parent.difficulty / U256::from(MAX_ADJUSTMENT_FACTOR)).max(U256::one());
    Ok(unclamped.clamp(floor, ceiling))
}
