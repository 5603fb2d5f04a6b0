//! Consensus and mining coordinator: candidate assembly and the nonce
//! search worker pool.
//!
//! Assembly is a single deterministic pass over a coherent snapshot; workers
//! grind disjoint nonce strides and are poisoned whenever a new candidate
//! generation replaces the current one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use primitive_types::U256;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ConsensusParams, MiningConfig};
use crate::crypto::hash256;
use crate::difficulty::required_difficulty_after;
use crate::errors::ChainResult;
use crate::history::History;
use crate::mempool::Mempool;
use crate::state::StateEngine;
use crate::types::header::HEADER_VERSION;
use crate::types::transaction::{Directive, Unlocker};
use crate::types::{
    merkle_root, unix_millis, Block, BlockHeader, BlockPayload, BoxId, ModifierId, Transaction,
};
use crate::wallet::Wallet;

/// Nonces tried between cancellation checks.
const WORKER_CHUNK: u64 = 10_000;
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Everything a worker needs to turn a nonce into a full block.
#[derive(Clone, Debug)]
pub struct CandidateBlock {
    pub parent_id: Option<ModifierId>,
    pub ad_proof_bytes: Vec<u8>,
    /// Signed header with a zero nonce; the signature covers everything but
    /// the nonce, so workers only swap the nonce in.
    pub header_template: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl CandidateBlock {
    pub fn difficulty(&self) -> U256 {
        self.header_template.difficulty
    }

    /// PoW message shared by every nonce of this candidate.
    pub fn message(&self) -> [u8; 32] {
        self.header_template.message()
    }

    pub fn to_block(&self, nonce: u64) -> Block {
        let mut header = self.header_template.clone();
        header.nonce = nonce;
        let payload = BlockPayload::new(header.id(), self.transactions.clone());
        Block::new(header, payload)
    }
}

/// Single deterministic candidate-assembly pass over a coherent snapshot.
/// Returns `None` when there is no chain to build on and offline generation
/// is disabled. Stateful-invalid mempool entries are eagerly dropped.
pub fn assemble_candidate(
    history: &History,
    state: &mut StateEngine,
    mempool: &mut Mempool,
    wallet: &Wallet,
    params: &ConsensusParams,
    mining: &MiningConfig,
) -> ChainResult<Option<CandidateBlock>> {
    let parent = match history.best_full_id()? {
        Some(id) => history.header_by_id(&id)?,
        None => None,
    };
    if parent.is_none() && !mining.offline_generation {
        return Ok(None);
    }

    let difficulty = match &parent {
        Some(parent) => {
            required_difficulty_after(parent, params, |id| history.header_by_id(id))?
        }
        None => params.initial_difficulty(),
    };
    let height = parent.as_ref().map_or(0, |p| p.height + 1);

    // Greedy fee-ordered selection under the size budget, re-validated
    // against the state snapshot.
    let budget = params.payload_budget();
    let mut selected: Vec<Transaction> = Vec::new();
    let mut used_inputs: std::collections::HashSet<BoxId> = std::collections::HashSet::new();
    let mut to_drop: Vec<ModifierId> = Vec::new();
    let mut total_size = 0usize;
    let mut total_fees: u64 = 0;
    for tx in mempool.ordered() {
        let size = tx.size();
        if total_size + size > budget {
            continue;
        }
        if tx.input_ids().any(|id| used_inputs.contains(id)) {
            continue;
        }
        if let Err(err) = state.validate(&tx) {
            debug!(id = %tx.id(), %err, "dropping stateful-invalid transaction");
            to_drop.push(tx.id());
            continue;
        }
        used_inputs.extend(tx.input_ids().copied());
        total_size += size;
        total_fees = total_fees.saturating_add(tx.fee);
        selected.push((*tx).clone());
    }
    mempool.remove_all(to_drop.iter());

    // Open coinbase boxes matured at this height, minus any the selected
    // transactions already spend, are folded into the new coinbase.
    let mut coinbase_value: u128 = u128::from(params.supply_at(height.max(0) as u32));
    let mut coinbase_inputs: Vec<Unlocker> = Vec::new();
    for open_box in state.open_coinbase_boxes(height)? {
        let id = open_box.id();
        if used_inputs.contains(&id) {
            continue;
        }
        if let Some((_, amount)) = open_box.monetary_value() {
            coinbase_value += u128::from(amount);
            coinbase_inputs.push(Unlocker {
                box_id: id,
                proof: None,
            });
        }
    }
    coinbase_value += u128::from(total_fees);
    let timestamp = unix_millis().max(
        parent
            .as_ref()
            .map_or(0, |p| p.timestamp + 1),
    );
    let coinbase = wallet.create_transaction(
        0,
        timestamp,
        coinbase_inputs,
        vec![Directive::Coinbase {
            amount: u64::try_from(coinbase_value).unwrap_or(u64::MAX),
            height,
        }],
    );

    let mut transactions = selected;
    transactions.push(coinbase);

    let (ad_proof_bytes, ad_digest) = state.proofs_for_transactions(&transactions)?;

    let leaves: Vec<[u8; 32]> = transactions.iter().map(|tx| tx.id().0).collect();
    let mut header_template = BlockHeader {
        version: HEADER_VERSION,
        parent_id: parent.as_ref().map_or(ModifierId::zero(), BlockHeader::id),
        ad_proofs_root: hash256(&ad_proof_bytes),
        transactions_root: merkle_root(&leaves),
        state_root: ad_digest,
        timestamp,
        height,
        difficulty,
        nonce: 0,
        miner_pub_key: wallet.public_key(),
        signature: wallet.sign(b"placeholder"),
    };
    header_template.signature = wallet.sign(&header_template.message());

    info!(height, txs = transactions.len(), "assembled candidate block");
    Ok(Some(CandidateBlock {
        parent_id: parent.map(|p| p.id()),
        ad_proof_bytes,
        header_template,
        transactions,
    }))
}

struct MinerShared {
    slot: RwLock<Option<Arc<CandidateBlock>>>,
    generation: AtomicU64,
    shutdown: AtomicBool,
    solution_tx: mpsc::Sender<Block>,
}

/// Worker pool searching nonces for the current candidate. Workers are
/// poisoned by a generation bump whenever a new candidate arrives and exit
/// on shutdown without leaving partial state behind.
pub struct Miner {
    shared: Arc<MinerShared>,
    workers: usize,
}

impl Miner {
    pub fn start(workers: usize, solution_tx: mpsc::Sender<Block>) -> Self {
        let shared = Arc::new(MinerShared {
            slot: RwLock::new(None),
            generation: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            solution_tx,
        });
        let workers = workers.max(1);
        for index in 0..workers {
            let shared = shared.clone();
            let stride = workers as u64;
            tokio::task::spawn_blocking(move || worker_loop(index as u64, stride, shared));
        }
        Miner { shared, workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Replaces the current candidate and restarts every worker on it.
    pub fn submit_candidate(&self, candidate: CandidateBlock) {
        *self.shared.slot.write() = Some(Arc::new(candidate));
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Stops the search until the next candidate arrives.
    pub fn pause(&self) {
        *self.shared.slot.write() = None;
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for Miner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(index: u64, stride: u64, shared: Arc<MinerShared>) {
    let mut solved_generation: Option<u64> = None;
    while !shared.shutdown.load(Ordering::SeqCst) {
        let generation = shared.generation.load(Ordering::SeqCst);
        let candidate = shared.slot.read().clone();
        let Some(candidate) = candidate else {
            std::thread::sleep(IDLE_POLL);
            continue;
        };
        if solved_generation == Some(generation) {
            // This candidate is already solved; wait for the next one.
            std::thread::sleep(IDLE_POLL);
            continue;
        }

        let message = candidate.message();
        let target = candidate.difficulty();
        let mut nonce = index;
        'search: loop {
            for _ in 0..WORKER_CHUNK {
                if BlockHeader::pow_hash(&message, nonce) <= target {
                    let block = candidate.to_block(nonce);
                    debug!(nonce, id = %block.id(), "worker found a solution");
                    if shared.solution_tx.blocking_send(block).is_err() {
                        return;
                    }
                    solved_generation = Some(generation);
                    break 'search;
                }
                nonce = nonce.wrapping_add(stride);
            }
            if shared.shutdown.load(Ordering::SeqCst)
                || shared.generation.load(Ordering::SeqCst) != generation
            {
                break 'search;
            }
        }
    }
    warn!("mining worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{deterministic_keypair, sign_message};
    use crate::types::AdDigest;

    fn candidate(difficulty: U256) -> CandidateBlock {
        let keypair = deterministic_keypair(23);
        let coinbase = Transaction::new_signed(
            &keypair,
            0,
            1_700_000_000_000,
            Vec::new(),
            vec![Directive::Coinbase {
                amount: 10,
                height: 0,
            }],
        );
        let leaves = vec![coinbase.id().0];
        let mut header_template = BlockHeader {
            version: HEADER_VERSION,
            parent_id: ModifierId::zero(),
            ad_proofs_root: [0u8; 32],
            transactions_root: merkle_root(&leaves),
            state_root: AdDigest::empty(),
            timestamp: 1_700_000_000_000,
            height: 0,
            difficulty,
            nonce: 0,
            miner_pub_key: keypair.public.to_bytes(),
            signature: sign_message(&keypair, b"placeholder"),
        };
        header_template.signature = sign_message(&keypair, &header_template.message());
        CandidateBlock {
            parent_id: None,
            ad_proof_bytes: Vec::new(),
            header_template,
            transactions: vec![coinbase],
        }
    }

    #[test]
    fn solved_nonce_yields_valid_block() {
        // An easy but non-trivial target: a few leading zero bits.
        let candidate = candidate(U256::MAX >> 8);
        let message = candidate.message();
        let mut nonce = 0u64;
        while BlockHeader::pow_hash(&message, nonce) > candidate.difficulty() {
            nonce += 1;
        }
        let block = candidate.to_block(nonce);
        assert!(block.header.pow_valid());
        block.header.syntactic_validity().unwrap();
        block.validate_structure().unwrap();
    }

    #[test]
    fn nonce_changes_do_not_break_signature() {
        let candidate = candidate(U256::MAX);
        let block_a = candidate.to_block(1);
        let block_b = candidate.to_block(2);
        assert_ne!(block_a.id(), block_b.id());
        block_a.header.verify_signature().unwrap();
        block_b.header.verify_signature().unwrap();
    }

    #[tokio::test]
    async fn workers_find_and_report_solutions() {
        let (tx, mut rx) = mpsc::channel(4);
        let miner = Miner::start(2, tx);
        miner.submit_candidate(candidate(U256::MAX >> 4));
        let block = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("mining timed out")
            .expect("channel open");
        assert!(block.header.pow_valid());
        miner.shutdown();
    }
}
