//! Authenticated state engine: the UTXO set behind a persistent batched AVL
//! dictionary, with versioned rollback and per-block proof generation.
//!
//! All mutation funnels through [`StateEngine::apply_block`] (or the
//! digest-only [`StateEngine::apply_header`]); any failure leaves the engine
//! at the pre-call digest. The box records, dictionary nodes and version
//! metadata of one block commit as a single store batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::avl::{AvlOp, AvlTree, Label, Node, NodeSource};
use crate::config::ConsensusParams;
use crate::crypto::hash256;
use crate::errors::{ChainError, ChainResult};
use crate::storage::VersionedStore;
use crate::types::boxes::{INTRINSIC_TOKEN_ID, UnlockContext};
use crate::types::{
    AdDigest, Block, BlockHeader, BoxId, ChainBox, Height, ModifierId, TokenId, Transaction,
    VersionTag, WireSerializable, PRE_GENESIS_HEIGHT,
};

const BOX_KEY_PREFIX: &[u8] = b"b:";
const NODE_KEY_PREFIX: &[u8] = b"n:";
const VERSION_ROOT_PREFIX: &[u8] = b"v:";
const ROOT_VERSION_PREFIX: &[u8] = b"r:";
const OPEN_COINBASE_PREFIX: &[u8] = b"cb:";
const BEST_VERSION_KEY: &[u8] = b"m:best_version";
const STATE_HEIGHT_KEY: &[u8] = b"m:state_height";
const LAST_TIMESTAMP_KEY: &[u8] = b"m:last_block_timestamp";

fn box_key(id: &BoxId) -> Vec<u8> {
    [BOX_KEY_PREFIX, id.to_bytes().as_slice()].concat()
}

fn node_key(label: &Label) -> Vec<u8> {
    [NODE_KEY_PREFIX, label.as_slice()].concat()
}

fn version_root_key(version: &VersionTag) -> Vec<u8> {
    [VERSION_ROOT_PREFIX, version.as_bytes().as_slice()].concat()
}

fn root_version_key(digest: &AdDigest) -> Vec<u8> {
    [ROOT_VERSION_PREFIX, hash256(&digest.to_bytes()).as_slice()].concat()
}

fn open_coinbase_key(id: &BoxId) -> Vec<u8> {
    [OPEN_COINBASE_PREFIX, id.to_bytes().as_slice()].concat()
}

struct StoreNodeSource {
    store: Arc<VersionedStore>,
}

impl NodeSource for StoreNodeSource {
    fn fetch(&self, label: &Label) -> ChainResult<Option<Node>> {
        match self.store.get(&node_key(label))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Boxes created and spent earlier in the same block, layered over the
/// committed store during sequential validation.
#[derive(Default)]
struct BoxOverlay {
    created: HashMap<BoxId, ChainBox>,
    spent: HashSet<BoxId>,
}

pub struct StateEngine {
    store: Arc<VersionedStore>,
    tree: AvlTree,
    params: ConsensusParams,
    version: VersionTag,
    height: Height,
    last_block_timestamp: u64,
}

impl StateEngine {
    /// Opens the engine over `store`, recovering the committed tip or
    /// starting empty at the pre-genesis sentinel.
    pub fn open(store: Arc<VersionedStore>, params: ConsensusParams) -> ChainResult<Self> {
        let source = Box::new(StoreNodeSource {
            store: store.clone(),
        });
        match store.get(BEST_VERSION_KEY)? {
            Some(version_bytes) => {
                let version = VersionTag(
                    version_bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| ChainError::Fatal("corrupt best version record".into()))?,
                );
                if store.current_version()? != Some(version) {
                    return Err(ChainError::Fatal(
                        "state metadata disagrees with store version log".into(),
                    ));
                }
                let root_bytes = store.get(&version_root_key(&version))?.ok_or_else(|| {
                    ChainError::Fatal("state root missing for best version".into())
                })?;
                let digest = AdDigest::from_bytes(&root_bytes)?;
                let tree = AvlTree::open_at(source, &digest)?;
                let height = read_height(&store)?;
                let last_block_timestamp = read_timestamp(&store)?;
                Ok(StateEngine {
                    store,
                    tree,
                    params,
                    version,
                    height,
                    last_block_timestamp,
                })
            }
            None => Ok(StateEngine {
                store,
                tree: AvlTree::new(source),
                params,
                version: ModifierId::zero(),
                height: PRE_GENESIS_HEIGHT,
                last_block_timestamp: 0,
            }),
        }
    }

    pub fn digest(&self) -> AdDigest {
        self.tree.digest()
    }

    pub fn version(&self) -> VersionTag {
        self.version
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn last_block_timestamp(&self) -> u64 {
        self.last_block_timestamp
    }

    /// Retained version tags, newest last.
    pub fn rollback_versions(&self) -> ChainResult<Vec<VersionTag>> {
        self.store.rollback_versions()
    }

    /// Digest recorded for a committed version, if still on disk.
    pub fn root_at_version(&self, version: &VersionTag) -> ChainResult<Option<AdDigest>> {
        match self.store.get(&version_root_key(version))? {
            Some(bytes) => Ok(Some(AdDigest::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Unauthenticated box lookup against the committed state.
    pub fn box_by_id(&self, id: &BoxId) -> ChainResult<Option<ChainBox>> {
        match self.store.get(&box_key(id))? {
            Some(bytes) => Ok(Some(ChainBox::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Coinbase boxes whose height lock has opened at `height`.
    pub fn open_coinbase_boxes(&self, height: Height) -> ChainResult<Vec<ChainBox>> {
        let mut out = Vec::new();
        for (key, value) in self.store.prefix_scan(OPEN_COINBASE_PREFIX)? {
            let lock = i32::from_le_bytes(
                value
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Fatal("corrupt coinbase index entry".into()))?,
            );
            if lock > height {
                continue;
            }
            let id_bytes = &key[OPEN_COINBASE_PREFIX.len()..];
            if id_bytes.len() != BoxId::SIZE {
                return Err(ChainError::Fatal("corrupt coinbase index key".into()));
            }
            let id = BoxId {
                tag: id_bytes[0],
                hash: id_bytes[1..]
                    .try_into()
                    .map_err(|_| ChainError::Fatal("corrupt coinbase index key".into()))?,
            };
            if let Some(chain_box) = self.box_by_id(&id)? {
                out.push(chain_box);
            }
        }
        Ok(out)
    }

    fn resolve_box(&self, overlay: &BoxOverlay, id: &BoxId) -> ChainResult<Option<ChainBox>> {
        if overlay.spent.contains(id) {
            return Ok(None);
        }
        if let Some(chain_box) = overlay.created.get(id) {
            return Ok(Some(chain_box.clone()));
        }
        self.box_by_id(id)
    }

    /// Validates `tx` against the committed state at the next block height.
    pub fn validate(&self, tx: &Transaction) -> ChainResult<()> {
        self.validate_at(tx, self.height + 1, &BoxOverlay::default())
    }

    /// Deterministic transaction validation: semantic checks, unlocker
    /// resolution and unlocking, then per-asset conservation.
    fn validate_at(
        &self,
        tx: &Transaction,
        height: Height,
        overlay: &BoxOverlay,
    ) -> ChainResult<()> {
        tx.semantic_validity(self.params.min_fee)?;

        let message = tx.message();
        let signature_bytes = tx.signature.to_bytes();
        let ctx = UnlockContext {
            tx_message: &message,
            height,
            last_block_timestamp: self.last_block_timestamp,
            state_root: self.tree.digest().root,
        };

        let mut spent: HashMap<TokenId, u128> = HashMap::new();
        for unlocker in &tx.unlockers {
            let input = self
                .resolve_box(overlay, &unlocker.box_id)?
                .ok_or_else(|| ChainError::StateInvalid("unknown input box".into()))?;
            let proof = unlocker
                .proof
                .as_deref()
                .unwrap_or(signature_bytes.as_slice());
            input.proposition().unlock(proof, &ctx)?;
            if let Some((token, amount)) = input.monetary_value() {
                *spent.entry(token).or_default() += u128::from(amount);
            }
        }

        let mut created: HashMap<TokenId, u128> = HashMap::new();
        for directive in &tx.directives {
            match directive {
                crate::types::Directive::Transfer {
                    amount, token_id, ..
                } => {
                    let token = token_id.unwrap_or(INTRINSIC_TOKEN_ID);
                    *created.entry(token).or_default() += u128::from(*amount);
                }
                crate::types::Directive::Coinbase { amount, .. } => {
                    *created.entry(INTRINSIC_TOKEN_ID).or_default() += u128::from(*amount);
                }
                crate::types::Directive::PubKeyInfo { .. } => {}
            }
        }

        for (token, created_amount) in &created {
            let mut required = *created_amount;
            if *token == INTRINSIC_TOKEN_ID {
                if tx.has_coinbase_directive() {
                    // Emission is checked at block level, where fees and the
                    // supply schedule are in scope.
                    continue;
                }
                required += u128::from(tx.fee);
            }
            let available = spent.get(token).copied().unwrap_or(0);
            if available < required {
                return Err(ChainError::SemanticInvalid(format!(
                    "asset overspend: {available} available, {required} required"
                )));
            }
        }
        Ok(())
    }

    /// Applies a full block. On success the engine sits at the block's state
    /// root; on any failure it is exactly at the pre-call digest.
    pub fn apply_block(&mut self, block: &Block) -> ChainResult<()> {
        let pre_digest = self.tree.digest();
        let result = self.apply_block_inner(block, &pre_digest);
        if result.is_err() {
            debug_assert_eq!(self.tree.digest(), pre_digest);
        }
        result
    }

    fn apply_block_inner(&mut self, block: &Block, pre_digest: &AdDigest) -> ChainResult<()> {
        let header = &block.header;
        if header.is_genesis() {
            if self.height != PRE_GENESIS_HEIGHT {
                return Err(ChainError::StateInvalid(
                    "genesis over a non-empty state".into(),
                ));
            }
        } else if header.parent_id != self.version {
            return Err(ChainError::StateInvalid(format!(
                "block parent {} does not extend state version {}",
                header.parent_id, self.version
            )));
        }
        if header.height != self.height + 1 {
            return Err(ChainError::StateInvalid(format!(
                "block height {} does not follow state height {}",
                header.height, self.height
            )));
        }
        let expected_store_version = if self.height == PRE_GENESIS_HEIGHT {
            None
        } else {
            Some(self.version)
        };
        if self.store.current_version()? != expected_store_version {
            return Err(ChainError::Fatal(
                "store rollback log disagrees with state version".into(),
            ));
        }
        block.validate_structure()?;

        let (ops, new_boxes, spent_boxes, fees) =
            self.collect_block_ops(&block.payload.transactions, header.height)?;
        self.check_emission(block, &spent_boxes, fees)?;

        let proof = self.tree.perform_batch(&ops)?;
        let new_digest = self.tree.digest();
        if new_digest != header.state_root {
            self.tree.rollback(pre_digest)?;
            return Err(ChainError::StateInvalid(format!(
                "state digest {new_digest} does not match header root {}",
                header.state_root
            )));
        }
        if hash256(&proof) != header.ad_proofs_root {
            self.tree.rollback(pre_digest)?;
            return Err(ChainError::StateInvalid("ad proof root mismatch".into()));
        }

        let version = header.id();
        let mut inserts: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut removes: Vec<Vec<u8>> = Vec::new();
        for chain_box in &new_boxes {
            let id = chain_box.id();
            inserts.push((box_key(&id), chain_box.to_bytes()));
            if let ChainBox::Coinbase(cb) = chain_box {
                inserts.push((open_coinbase_key(&id), cb.height_lock.to_le_bytes().to_vec()));
            }
        }
        for (id, chain_box) in &spent_boxes {
            removes.push(box_key(id));
            if matches!(chain_box, ChainBox::Coinbase(_)) {
                removes.push(open_coinbase_key(id));
            }
        }
        for (label, bytes) in self.tree.dirty_nodes()? {
            inserts.push((node_key(&label), bytes));
        }
        inserts.push((version_root_key(&version), new_digest.to_bytes().to_vec()));
        inserts.push((root_version_key(&new_digest), version.as_bytes().to_vec()));
        inserts.push((BEST_VERSION_KEY.to_vec(), version.as_bytes().to_vec()));
        inserts.push((
            STATE_HEIGHT_KEY.to_vec(),
            header.height.to_le_bytes().to_vec(),
        ));
        inserts.push((
            LAST_TIMESTAMP_KEY.to_vec(),
            header.timestamp.to_le_bytes().to_vec(),
        ));

        if let Err(err) = self.store.commit(version, &inserts, &removes) {
            self.tree.rollback(pre_digest)?;
            return Err(err);
        }
        self.tree.mark_committed();
        self.version = version;
        self.height = header.height;
        self.last_block_timestamp = header.timestamp;
        debug!(height = self.height, version = %self.version, "state advanced");
        Ok(())
    }

    /// Validates the transactions in order and gathers the dictionary batch
    /// along with created boxes, spent boxes and collected fees.
    #[allow(clippy::type_complexity)]
    fn collect_block_ops(
        &self,
        transactions: &[Transaction],
        height: Height,
    ) -> ChainResult<(Vec<AvlOp>, Vec<ChainBox>, Vec<(BoxId, ChainBox)>, u64)> {
        let mut overlay = BoxOverlay::default();
        let mut ops = Vec::new();
        let mut new_boxes = Vec::new();
        let mut spent_boxes = Vec::new();
        let mut fees: u64 = 0;

        for tx in transactions {
            self.validate_at(tx, height, &overlay)?;
            if !tx.has_coinbase_directive() {
                fees = fees.saturating_add(tx.fee);
            }
            for unlocker in &tx.unlockers {
                let input = self
                    .resolve_box(&overlay, &unlocker.box_id)?
                    .ok_or_else(|| ChainError::StateInvalid("unknown input box".into()))?;
                overlay.spent.insert(unlocker.box_id);
                ops.push(AvlOp::Remove {
                    key: unlocker.box_id,
                });
                spent_boxes.push((unlocker.box_id, input));
            }
            for output in tx.outputs(self.params.coinbase_maturity) {
                let id = output.id();
                ops.push(AvlOp::Insert {
                    key: id,
                    value: output.to_bytes(),
                });
                overlay.created.insert(id, output.clone());
                new_boxes.push(output);
            }
        }
        Ok((ops, new_boxes, spent_boxes, fees))
    }

    /// Block-level conservation: the coinbase may create at most the value
    /// it spends plus the emission schedule plus the fees of the block.
    fn check_emission(
        &self,
        block: &Block,
        spent_boxes: &[(BoxId, ChainBox)],
        fees: u64,
    ) -> ChainResult<()> {
        let coinbase = block
            .payload
            .transactions
            .last()
            .ok_or_else(|| ChainError::SemanticInvalid("block has no transactions".into()))?;
        let coinbase_inputs: HashSet<BoxId> = coinbase.input_ids().copied().collect();
        let spent_value: u128 = spent_boxes
            .iter()
            .filter(|(id, _)| coinbase_inputs.contains(id))
            .filter_map(|(_, chain_box)| chain_box.monetary_value())
            .filter(|(token, _)| *token == INTRINSIC_TOKEN_ID)
            .map(|(_, amount)| u128::from(amount))
            .sum();
        let created_value: u128 = coinbase
            .directives
            .iter()
            .filter_map(|directive| match directive {
                crate::types::Directive::Coinbase { amount, .. } => Some(u128::from(*amount)),
                crate::types::Directive::Transfer {
                    amount, token_id, ..
                } if token_id.is_none() => Some(u128::from(*amount)),
                _ => None,
            })
            .sum();
        let emission = u128::from(self.params.supply_at(block.header.height.max(0) as u32));
        if created_value > spent_value + emission + u128::from(fees) {
            return Err(ChainError::StateInvalid(format!(
                "coinbase creates {created_value}, allowed {}",
                spent_value + emission + u128::from(fees)
            )));
        }
        Ok(())
    }

    /// Advances only the version marker; the dictionary is untouched.
    /// Used when payloads are not validated (digest-only operation).
    pub fn apply_header(&mut self, header: &BlockHeader) -> ChainResult<()> {
        let version = header.id();
        let digest = self.tree.digest();
        let inserts = vec![
            (version_root_key(&version), digest.to_bytes().to_vec()),
            (BEST_VERSION_KEY.to_vec(), version.as_bytes().to_vec()),
            (
                STATE_HEIGHT_KEY.to_vec(),
                header.height.to_le_bytes().to_vec(),
            ),
            (
                LAST_TIMESTAMP_KEY.to_vec(),
                header.timestamp.to_le_bytes().to_vec(),
            ),
        ];
        self.store.commit(version, &inserts, &[])?;
        self.version = version;
        self.height = header.height;
        self.last_block_timestamp = header.timestamp;
        Ok(())
    }

    /// Rolls every index and the dictionary back to `version`. The target
    /// must be inside the retained window.
    pub fn rollback_to(&mut self, version: &VersionTag) -> ChainResult<()> {
        if *version == self.version {
            return Ok(());
        }
        self.store.rollback_to(version)?;
        let root_bytes = self
            .store
            .get(&version_root_key(version))?
            .ok_or_else(|| ChainError::Fatal("state root missing after rollback".into()))?;
        let digest = AdDigest::from_bytes(&root_bytes)?;
        self.tree.rollback(&digest)?;
        self.version = *version;
        self.height = read_height(&self.store)?;
        self.last_block_timestamp = read_timestamp(&self.store)?;
        debug!(height = self.height, version = %self.version, "state rolled back");
        Ok(())
    }

    /// Speculatively applies `txs`, captures the proof and the resulting
    /// digest, then unconditionally restores the pre-speculation digest.
    pub fn proofs_for_transactions(
        &mut self,
        txs: &[Transaction],
    ) -> ChainResult<(Vec<u8>, AdDigest)> {
        let height = self.height + 1;
        let (ops, _, _, _) = self.collect_block_ops(txs, height)?;
        let pre_digest = self.tree.digest();
        let result = self.tree.run_speculative(&ops);
        debug_assert_eq!(self.tree.digest(), pre_digest);
        result
    }
}

fn read_height(store: &VersionedStore) -> ChainResult<Height> {
    match store.get(STATE_HEIGHT_KEY)? {
        Some(bytes) => Ok(i32::from_le_bytes(bytes.as_slice().try_into().map_err(
            |_| ChainError::Fatal("corrupt state height record".into()),
        )?)),
        None => Ok(PRE_GENESIS_HEIGHT),
    }
}

fn read_timestamp(store: &VersionedStore) -> ChainResult<u64> {
    match store.get(LAST_TIMESTAMP_KEY)? {
        Some(bytes) => Ok(u64::from_le_bytes(bytes.as_slice().try_into().map_err(
            |_| ChainError::Fatal("corrupt state timestamp record".into()),
        )?)),
        None => Ok(0),
    }
}
