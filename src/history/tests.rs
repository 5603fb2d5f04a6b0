use std::sync::Arc;

use ed25519_dalek::Keypair;

use crate::config::ConsensusParams;
use crate::crypto::{deterministic_keypair, sign_message};
use crate::errors::ChainError;
use crate::storage::VersionedStore;
use crate::types::header::HEADER_VERSION;
use crate::types::transaction::Directive;
use crate::types::{
    AdDigest, Block, BlockHeader, BlockPayload, Modifier, ModifierId, SyncInfo, Transaction,
};

use super::{ChainComparison, History, SemanticValidity};

/// Builds structurally valid blocks with trivial PoW for history tests. The
/// state roots are synthetic; history does not check them.
pub(crate) struct ChainBuilder {
    keypair: Keypair,
    params: ConsensusParams,
}

impl ChainBuilder {
    pub(crate) fn new() -> Self {
        ChainBuilder {
            keypair: deterministic_keypair(42),
            params: test_params(),
        }
    }

    /// A block on `parent` (or genesis); `salt` differentiates siblings.
    pub(crate) fn block_on(&self, parent: Option<&BlockHeader>, salt: u64) -> Block {
        let height = parent.map_or(0, |p| p.height + 1);
        let timestamp = parent.map_or(1_700_000_000_000, |p| p.timestamp + 30_000);
        let coinbase = Transaction::new_signed(
            &self.keypair,
            0,
            timestamp + salt,
            Vec::new(),
            vec![Directive::Coinbase {
                amount: 100,
                height,
            }],
        );
        let transactions = vec![coinbase];
        let leaves: Vec<[u8; 32]> = transactions.iter().map(|tx| tx.id().0).collect();
        let mut header = BlockHeader {
            version: HEADER_VERSION,
            parent_id: parent.map_or(ModifierId::zero(), |p| p.id()),
            ad_proofs_root: [0u8; 32],
            transactions_root: crate::types::merkle_root(&leaves),
            state_root: AdDigest::empty(),
            timestamp,
            height,
            difficulty: self.params.initial_difficulty(),
            nonce: 0,
            miner_pub_key: self.keypair.public.to_bytes(),
            signature: sign_message(&self.keypair, b"placeholder"),
        };
        header.signature = sign_message(&self.keypair, &header.message());
        let payload = BlockPayload::new(header.id(), transactions);
        Block::new(header, payload)
    }

    /// `len` blocks on top of `parent`, oldest first.
    pub(crate) fn chain_on(&self, parent: Option<&BlockHeader>, len: usize, salt: u64) -> Vec<Block> {
        let mut blocks: Vec<Block> = Vec::with_capacity(len);
        for i in 0..len {
            let parent_header = if i == 0 {
                parent.cloned()
            } else {
                Some(blocks[i - 1].header.clone())
            };
            blocks.push(self.block_on(parent_header.as_ref(), salt));
        }
        blocks
    }
}

pub(crate) fn test_params() -> ConsensusParams {
    let mut params = ConsensusParams::default();
    // Trivial PoW target so any nonce solves.
    params.initial_target_bits = 0;
    params
}

fn open_history() -> (tempfile::TempDir, History) {
    let dir = tempfile::tempdir().unwrap();
    let params = test_params();
    let store = Arc::new(VersionedStore::open(dir.path(), params.keep_versions).unwrap());
    (dir, History::open(store, params))
}

/// Appends header and payload, returning the payload's progress info.
fn append_block(history: &mut History, block: &Block) -> super::ProgressInfo {
    history
        .append(&Modifier::Header(block.header.clone()))
        .unwrap();
    history
        .append(&Modifier::Payload(block.payload.clone()))
        .unwrap()
}

#[test]
fn genesis_append_produces_apply_instruction() {
    let (_dir, mut history) = open_history();
    let builder = ChainBuilder::new();
    let genesis = builder.block_on(None, 0);

    let after_header = history
        .append(&Modifier::Header(genesis.header.clone()))
        .unwrap();
    assert!(after_header.is_empty());
    assert_eq!(history.best_header_id().unwrap(), Some(genesis.id()));
    assert_eq!(history.best_full_id().unwrap(), None);

    let progress = history
        .append(&Modifier::Payload(genesis.payload.clone()))
        .unwrap();
    assert_eq!(progress.to_apply.len(), 1);
    assert!(progress.to_remove.is_empty());
    assert_eq!(progress.branch_point, None);
    assert_eq!(history.best_full_id().unwrap(), Some(genesis.id()));
    assert_eq!(history.best_height().unwrap(), 0);
}

#[test]
fn append_is_idempotent() {
    let (_dir, mut history) = open_history();
    let builder = ChainBuilder::new();
    let genesis = builder.block_on(None, 0);
    append_block(&mut history, &genesis);

    let again = history
        .append(&Modifier::Header(genesis.header.clone()))
        .unwrap();
    assert!(again.is_empty());
    let again = history
        .append(&Modifier::Payload(genesis.payload.clone()))
        .unwrap();
    assert!(again.is_empty());
    assert_eq!(history.best_full_id().unwrap(), Some(genesis.id()));
}

#[test]
fn orphan_header_is_not_applicable() {
    let (_dir, mut history) = open_history();
    let builder = ChainBuilder::new();
    let genesis = builder.block_on(None, 0);
    let orphan = builder.block_on(Some(&genesis.header), 0);

    assert!(!history
        .applicable(&Modifier::Header(orphan.header.clone()))
        .unwrap());
    let err = history
        .append(&Modifier::Header(orphan.header.clone()))
        .unwrap_err();
    assert!(matches!(err, ChainError::NotApplicable(_)));
}

#[test]
fn extension_emits_single_block_apply() {
    let (_dir, mut history) = open_history();
    let builder = ChainBuilder::new();
    let genesis = builder.block_on(None, 0);
    append_block(&mut history, &genesis);

    let next = builder.block_on(Some(&genesis.header), 0);
    let progress = append_block(&mut history, &next);
    assert_eq!(progress.to_apply.len(), 1);
    assert_eq!(progress.to_apply[0].id(), next.id());
    assert!(progress.to_remove.is_empty());
    assert_eq!(progress.branch_point, None);
}

#[test]
fn heavier_fork_triggers_reorganization() {
    let (_dir, mut history) = open_history();
    let builder = ChainBuilder::new();
    let genesis = builder.block_on(None, 0);
    append_block(&mut history, &genesis);

    let chain_a = builder.chain_on(Some(&genesis.header), 2, 1);
    for block in &chain_a {
        append_block(&mut history, block);
    }
    assert_eq!(history.best_full_id().unwrap(), Some(chain_a[1].id()));

    // Longer (heavier) competing branch, fully validated.
    let chain_b = builder.chain_on(Some(&genesis.header), 3, 2);
    let mut last_progress = super::ProgressInfo::empty();
    for block in &chain_b {
        last_progress = append_block(&mut history, block);
    }

    assert_eq!(last_progress.branch_point, Some(genesis.id()));
    let removed: Vec<ModifierId> = last_progress.to_remove.iter().map(Block::id).collect();
    assert_eq!(removed, vec![chain_a[1].id(), chain_a[0].id()]);
    let applied: Vec<ModifierId> = last_progress.to_apply.iter().map(Block::id).collect();
    assert_eq!(
        applied,
        vec![chain_b[0].id(), chain_b[1].id(), chain_b[2].id()]
    );
    assert_eq!(history.best_full_id().unwrap(), Some(chain_b[2].id()));
    assert!(history.is_on_best_chain(&chain_b[2].id()).unwrap());
    assert!(!history.is_on_best_chain(&chain_a[1].id()).unwrap());
}

#[test]
fn equal_score_fork_keeps_incumbent() {
    let (_dir, mut history) = open_history();
    let builder = ChainBuilder::new();
    let genesis = builder.block_on(None, 0);
    append_block(&mut history, &genesis);

    let incumbent = builder.chain_on(Some(&genesis.header), 2, 1);
    for block in &incumbent {
        append_block(&mut history, block);
    }
    let challenger = builder.chain_on(Some(&genesis.header), 2, 9);
    let mut progress = super::ProgressInfo::empty();
    for block in &challenger {
        progress = append_block(&mut history, block);
    }
    assert!(progress.is_empty());
    assert_eq!(history.best_full_id().unwrap(), Some(incumbent[1].id()));
    assert_eq!(history.best_header_id().unwrap(), Some(incumbent[1].id()));
}

#[test]
fn sync_comparison_and_continuation() {
    let (_dir, mut history) = open_history();
    let builder = ChainBuilder::new();
    let genesis = builder.block_on(None, 0);
    append_block(&mut history, &genesis);
    let chain = builder.chain_on(Some(&genesis.header), 3, 0);
    for block in &chain {
        append_block(&mut history, block);
    }
    // Local best chain: [g, a1, a2, a3].
    let remote = SyncInfo::new(false, vec![genesis.id(), chain[0].id()]);
    assert_eq!(history.compare(&remote).unwrap(), ChainComparison::Older);

    let continuation = history.continuation_ids(&remote, 2).unwrap().unwrap();
    assert_eq!(continuation, vec![chain[1].id(), chain[2].id()]);

    let equal = SyncInfo::new(false, vec![chain[2].id()]);
    assert_eq!(history.compare(&equal).unwrap(), ChainComparison::Equal);

    let empty_remote = SyncInfo::default();
    assert_eq!(
        history.compare(&empty_remote).unwrap(),
        ChainComparison::Younger
    );
    let bootstrap = history.continuation_ids(&empty_remote, 3).unwrap().unwrap();
    assert_eq!(bootstrap, vec![genesis.id(), chain[0].id(), chain[1].id()]);

    let disjoint = SyncInfo::new(false, vec![ModifierId([9u8; 32])]);
    assert_eq!(
        history.compare(&disjoint).unwrap(),
        ChainComparison::Nonsense
    );
    assert!(history.continuation_ids(&disjoint, 2).unwrap().is_none());
}

#[test]
fn continuation_header_chains_cover_forks() {
    let (_dir, mut history) = open_history();
    let builder = ChainBuilder::new();
    let genesis = builder.block_on(None, 0);
    append_block(&mut history, &genesis);
    let chain_a = builder.chain_on(Some(&genesis.header), 2, 1);
    let chain_b = builder.chain_on(Some(&genesis.header), 1, 2);
    for block in chain_a.iter().chain(chain_b.iter()) {
        append_block(&mut history, block);
    }

    let mut chains = history
        .continuation_header_chains(&genesis.header)
        .unwrap();
    chains.sort_by_key(Vec::len);
    assert_eq!(chains.len(), 2);
    assert_eq!(chains[0].len(), 2); // g -> b1
    assert_eq!(chains[1].len(), 3); // g -> a1 -> a2
}

#[test]
fn semantic_validity_states() {
    let (_dir, mut history) = open_history();
    let builder = ChainBuilder::new();
    let genesis = builder.block_on(None, 0);

    assert_eq!(
        history.is_semantically_valid(&genesis.id()).unwrap(),
        SemanticValidity::Absent
    );
    append_block(&mut history, &genesis);
    assert_eq!(
        history.is_semantically_valid(&genesis.id()).unwrap(),
        SemanticValidity::Unknown
    );
    history.mark_valid(&genesis.id()).unwrap();
    assert_eq!(
        history.is_semantically_valid(&genesis.id()).unwrap(),
        SemanticValidity::Valid
    );
}

#[test]
fn report_invalid_demotes_branch() {
    let (_dir, mut history) = open_history();
    let builder = ChainBuilder::new();
    let genesis = builder.block_on(None, 0);
    append_block(&mut history, &genesis);
    history.mark_valid(&genesis.id()).unwrap();

    let chain_a = builder.chain_on(Some(&genesis.header), 2, 1);
    for block in &chain_a {
        append_block(&mut history, block);
    }
    let chain_b = builder.chain_on(Some(&genesis.header), 3, 2);
    for block in &chain_b {
        append_block(&mut history, block);
    }
    assert_eq!(history.best_full_id().unwrap(), Some(chain_b[2].id()));

    // The state failed applying b1 while sitting at genesis.
    let progress = history
        .report_invalid(&chain_b[0].id(), Some(genesis.id()))
        .unwrap();
    assert_eq!(
        history.is_semantically_valid(&chain_b[2].id()).unwrap(),
        SemanticValidity::Invalid
    );
    assert_eq!(history.best_full_id().unwrap(), Some(chain_a[1].id()));
    assert_eq!(history.best_header_id().unwrap(), Some(chain_a[1].id()));
    let applied: Vec<ModifierId> = progress.to_apply.iter().map(Block::id).collect();
    assert_eq!(applied, vec![chain_a[0].id(), chain_a[1].id()]);
    assert!(progress.to_remove.is_empty());
}

#[test]
fn oversized_payload_rejected() {
    let builder = ChainBuilder::new();
    let mut params = test_params();
    params.max_block_size = 64;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(VersionedStore::open(dir.path(), params.keep_versions).unwrap());
    let mut history = History::open(store, params);

    let genesis = builder.block_on(None, 0);
    history
        .append(&Modifier::Header(genesis.header.clone()))
        .unwrap();
    let err = history
        .append(&Modifier::Payload(genesis.payload.clone()))
        .unwrap_err();
    assert!(matches!(err, ChainError::SemanticInvalid(_)));
}
