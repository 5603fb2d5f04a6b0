//! Node view orchestrator.
//!
//! All mutating modifier applications are serialized through one write path:
//! history append, progress-info application against the state, mempool
//! cleanup. Readers obtain coherent snapshots through [`NodeHandle::with_view`].
//! Events are published after the atomic commit, in apply order; slow
//! subscribers lag and drop the oldest events.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::errors::{ChainError, ChainResult};
use crate::history::{ChainComparison, History, ProgressInfo};
use crate::mempool::Mempool;
use crate::miner::{assemble_candidate, Miner};
use crate::state::StateEngine;
use crate::storage::VersionedStore;
use crate::types::{unix_millis, Modifier, ModifierId, SyncInfo, Transaction};
use crate::wallet::Wallet;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const SOLUTION_CHANNEL_CAPACITY: usize = 8;
const MAX_PENDING_MODIFIERS: usize = 1024;
const MAX_RECOVERY_ROUNDS: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    /// A block passed state application and history committed it.
    SemanticallySuccessfulModifier(ModifierId),
    /// A block failed state application and was marked invalid.
    SemanticallyFailedModifier(ModifierId),
}

struct Components {
    history: History,
    state: StateEngine,
    mempool: Mempool,
    wallet: Wallet,
}

/// Coherent snapshot handed to readers; borrows live only for the closure.
pub struct NodeView<'a> {
    pub history: &'a History,
    pub state: &'a StateEngine,
    pub mempool: &'a Mempool,
    pub wallet: &'a Wallet,
}

enum ApplyOutcome {
    Applied(Vec<ModifierId>),
    Deferred,
    Skipped,
}

pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    components: RwLock<Components>,
    events: broadcast::Sender<NodeEvent>,
    /// Modifiers waiting for a prerequisite, keyed by the missing id.
    pending: Mutex<HashMap<ModifierId, Vec<Modifier>>>,
}

#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(config: NodeConfig) -> ChainResult<Self> {
        config.ensure_directories()?;
        let params = config.consensus.clone();
        let wallet = Wallet::open(&config.key_path)?;
        let history_store = Arc::new(VersionedStore::open(
            &config.history_db_path(),
            params.keep_versions,
        )?);
        let state_store = Arc::new(VersionedStore::open(
            &config.state_db_path(),
            params.keep_versions,
        )?);
        let history = History::open(history_store, params.clone());
        let state = StateEngine::open(state_store, params.clone())?;
        let mempool = Mempool::new(params.mempool_capacity, params.min_fee);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let mut components = Components {
            history,
            state,
            mempool,
            wallet,
        };
        catch_up(&mut components, &events)?;

        info!(
            address = %components.wallet.address(),
            height = components.history.best_height()?,
            "node ready"
        );
        Ok(Node {
            inner: Arc::new(NodeInner {
                config,
                components: RwLock::new(components),
                events,
                pending: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            inner: self.inner.clone(),
        }
    }

    /// Runs the mining loop until the process is stopped. Without mining
    /// enabled this only keeps the orchestrator alive.
    pub async fn start(self) -> ChainResult<()> {
        let inner = self.inner;
        let mining = inner.config.mining.clone();
        let (solution_tx, mut solution_rx) = mpsc::channel(SOLUTION_CHANNEL_CAPACITY);
        let miner = mining
            .enabled
            .then(|| Miner::start(mining.workers, solution_tx.clone()));
        // Held so the solution channel stays open for non-mining nodes.
        let _solution_tx = solution_tx;
        let mut events_rx = inner.events.subscribe();

        if let Some(miner) = &miner {
            let wait = mining.start_time_ms.saturating_sub(unix_millis());
            if wait > 0 {
                info!(wait_ms = wait, "mining deferred until start time");
                time::sleep(Duration::from_millis(wait)).await;
            }
            if let Err(err) = inner.regenerate_candidate(miner) {
                warn!(%err, "initial candidate assembly failed");
            }
        }

        let mut ticker = time::interval(Duration::from_secs(
            inner.config.consensus.block_interval_secs.max(1),
        ));
        loop {
            tokio::select! {
                maybe_block = solution_rx.recv() => {
                    let Some(block) = maybe_block else { return Ok(()) };
                    let id = block.id();
                    info!(%id, height = block.height(), "locally mined block");
                    let header = Modifier::Header(block.header.clone());
                    let payload = Modifier::Payload(block.payload);
                    match inner.apply_modifier(header) {
                        Ok(_) => {
                            if let Err(err) = inner.apply_modifier(payload) {
                                warn!(%id, %err, "mined payload rejected");
                            }
                        }
                        Err(err) => warn!(%id, %err, "mined header rejected"),
                    }
                }
                event = events_rx.recv() => {
                    match event {
                        Ok(NodeEvent::SemanticallySuccessfulModifier(_))
                        | Ok(NodeEvent::SemanticallyFailedModifier(_)) => {
                            if let Some(miner) = &miner {
                                if let Err(err) = inner.regenerate_candidate(miner) {
                                    warn!(%err, "candidate assembly failed, retrying on next trigger");
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
                _ = ticker.tick() => {
                    if let Some(miner) = &miner {
                        // Periodic refresh keeps timestamps current and folds
                        // newly pooled transactions into the candidate.
                        if let Err(err) = inner.regenerate_candidate(miner) {
                            warn!(%err, "candidate assembly failed, retrying on next trigger");
                        }
                    }
                }
            }
        }
    }
}

impl NodeInner {
    /// Serialized apply path: exactly one modifier application is in flight
    /// at any time. Returns the ids of blocks that reached the state.
    fn apply_modifier(&self, modifier: Modifier) -> ChainResult<Vec<ModifierId>> {
        let mut applied = Vec::new();
        let mut queue = VecDeque::from([modifier]);
        while let Some(next) = queue.pop_front() {
            let id = next.id();
            match self.apply_one(&next)? {
                ApplyOutcome::Applied(ids) => applied.extend(ids),
                ApplyOutcome::Skipped => {}
                ApplyOutcome::Deferred => continue,
            }
            // A stored modifier may unblock queued dependents.
            let follow_ups = self.pending.lock().remove(&id);
            if let Some(follow_ups) = follow_ups {
                queue.extend(follow_ups);
            }
        }
        Ok(applied)
    }

    fn apply_one(&self, modifier: &Modifier) -> ChainResult<ApplyOutcome> {
        let mut guard = self.components.write();
        let components = &mut *guard;

        let missing = match modifier {
            Modifier::Header(header) => {
                if components.history.contains_header(&header.id())? {
                    return Ok(ApplyOutcome::Skipped);
                }
                if !header.is_genesis() && !components.history.contains_header(&header.parent_id)? {
                    Some(header.parent_id)
                } else {
                    None
                }
            }
            Modifier::Payload(payload) => {
                if !components.history.contains_header(&payload.header_id)? {
                    Some(payload.header_id)
                } else if components
                    .history
                    .payload_by_header(&payload.header_id)?
                    .is_some()
                {
                    return Ok(ApplyOutcome::Skipped);
                } else {
                    None
                }
            }
        };
        if let Some(prerequisite) = missing {
            drop(guard);
            self.defer(prerequisite, modifier.clone());
            return Ok(ApplyOutcome::Deferred);
        }

        let progress = components.history.append(modifier)?;
        let applied = apply_progress(components, &self.events, progress)?;
        drop(guard);
        for id in &applied {
            let _ = self
                .events
                .send(NodeEvent::SemanticallySuccessfulModifier(*id));
        }
        Ok(ApplyOutcome::Applied(applied))
    }

    fn defer(&self, prerequisite: ModifierId, modifier: Modifier) {
        let mut pending = self.pending.lock();
        let backlog: usize = pending.values().map(Vec::len).sum();
        if backlog >= MAX_PENDING_MODIFIERS {
            warn!(%prerequisite, "pending modifier buffer full, dropping modifier");
            return;
        }
        debug!(%prerequisite, "modifier deferred until its prerequisite arrives");
        pending.entry(prerequisite).or_default().push(modifier);
    }

    fn regenerate_candidate(&self, miner: &Miner) -> ChainResult<()> {
        let mut guard = self.components.write();
        let components = &mut *guard;
        let candidate = assemble_candidate(
            &components.history,
            &mut components.state,
            &mut components.mempool,
            &components.wallet,
            &self.config.consensus,
            &self.config.mining,
        )?;
        drop(guard);
        match candidate {
            Some(candidate) => miner.submit_candidate(candidate),
            None => miner.pause(),
        }
        Ok(())
    }
}

/// Applies one progress instruction set, recovering from semantically
/// invalid blocks by demoting them in history and following the replacement
/// instructions, a bounded number of times.
fn apply_progress(
    components: &mut Components,
    events: &broadcast::Sender<NodeEvent>,
    mut progress: ProgressInfo,
) -> ChainResult<Vec<ModifierId>> {
    if progress.is_empty() {
        return Ok(Vec::new());
    }
    let mut applied = Vec::new();
    for _ in 0..MAX_RECOVERY_ROUNDS {
        if let Some(branch_point) = progress.branch_point {
            components.state.rollback_to(&branch_point)?;
        }
        // Transactions of removed blocks are candidates for re-admission,
        // in block order then intra-block order.
        let readmit: Vec<Transaction> = progress
            .to_remove
            .iter()
            .rev()
            .flat_map(|block| block.payload.transactions.iter())
            .filter(|tx| !tx.has_coinbase_directive())
            .cloned()
            .collect();

        let mut failure: Option<ModifierId> = None;
        for block in &progress.to_apply {
            match components.state.apply_block(block) {
                Ok(()) => {
                    let id = block.id();
                    components.history.mark_valid(&id)?;
                    let confirmed: Vec<ModifierId> = block
                        .payload
                        .transactions
                        .iter()
                        .map(Transaction::id)
                        .collect();
                    components.mempool.remove_all(confirmed.iter());
                    applied.push(id);
                }
                Err(err) if err.is_validation() => {
                    warn!(id = %block.id(), %err, "block failed state application");
                    failure = Some(block.id());
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        // Best-effort: a rolled-back transaction returns to the pool only if
        // it is still valid against the new tip.
        for tx in readmit {
            if components.state.validate(&tx).is_ok() {
                let _ = components.mempool.put(tx);
            }
        }
        match failure {
            None => return Ok(applied),
            Some(id) => {
                let _ = events.send(NodeEvent::SemanticallyFailedModifier(id));
                let from = (components.state.height() >= 0).then(|| components.state.version());
                progress = components.history.report_invalid(&id, from)?;
                if progress.is_empty() {
                    return Ok(applied);
                }
            }
        }
    }
    Err(ChainError::Fatal(
        "progress recovery did not converge".into(),
    ))
}

/// Reconciles a state left behind by a crash with the history's best full
/// chain before the node goes live.
fn catch_up(
    components: &mut Components,
    events: &broadcast::Sender<NodeEvent>,
) -> ChainResult<()> {
    let Some(target) = components.history.best_full_id()? else {
        return Ok(());
    };
    let from = (components.state.height() >= 0).then(|| components.state.version());
    if from == Some(target) {
        return Ok(());
    }
    info!(%target, "state catches up with history");
    let progress = components.history.progress_between(from, &target)?;
    apply_progress(components, events, progress)?;
    Ok(())
}

impl NodeHandle {
    /// Runs `f` over a coherent read snapshot of all components.
    pub fn with_view<R>(&self, f: impl FnOnce(NodeView<'_>) -> R) -> R {
        let guard = self.inner.components.read();
        f(NodeView {
            history: &guard.history,
            state: &guard.state,
            mempool: &guard.mempool,
            wallet: &guard.wallet,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Validates against the current best-full state, then pools.
    pub fn submit_transaction(&self, tx: Transaction) -> ChainResult<ModifierId> {
        let id = tx.id();
        let mut guard = self.inner.components.write();
        guard.state.validate(&tx)?;
        guard.mempool.put(tx)?;
        debug!(%id, "transaction pooled");
        Ok(id)
    }

    /// Feeds a header or payload through the serialized apply path; returns
    /// the ids of blocks that reached the state.
    pub fn submit_modifier(&self, modifier: Modifier) -> ChainResult<Vec<ModifierId>> {
        self.inner.apply_modifier(modifier)
    }

    /// Assembles a candidate over the current view and solves it
    /// synchronously. Offline block production for tooling and tests; the
    /// background worker pool is the production path.
    pub fn generate_block(&self) -> ChainResult<crate::types::Block> {
        let mut guard = self.inner.components.write();
        let components = &mut *guard;
        let candidate = assemble_candidate(
            &components.history,
            &mut components.state,
            &mut components.mempool,
            &components.wallet,
            &self.inner.config.consensus,
            &self.inner.config.mining,
        )?
        .ok_or_else(|| {
            ChainError::NotApplicable("no chain to build on and offline generation disabled".into())
        })?;
        drop(guard);
        let message = candidate.message();
        let target = candidate.difficulty();
        let mut nonce = 0u64;
        while crate::types::BlockHeader::pow_hash(&message, nonce) > target {
            nonce = nonce.checked_add(1).ok_or_else(|| {
                ChainError::NotApplicable("nonce space exhausted for candidate".into())
            })?;
        }
        Ok(candidate.to_block(nonce))
    }

    pub fn sync_info(&self, answer: bool) -> ChainResult<SyncInfo> {
        self.inner.components.read().history.sync_info(answer)
    }

    pub fn compare(&self, remote: &SyncInfo) -> ChainResult<ChainComparison> {
        self.inner.components.read().history.compare(remote)
    }

    pub fn continuation_ids(
        &self,
        remote: &SyncInfo,
        size: usize,
    ) -> ChainResult<Option<Vec<ModifierId>>> {
        self.inner
            .components
            .read()
            .history
            .continuation_ids(remote, size)
    }

    pub fn best_height(&self) -> ChainResult<i32> {
        self.inner.components.read().history.best_height()
    }

    pub fn best_full_id(&self) -> ChainResult<Option<ModifierId>> {
        self.inner.components.read().history.best_full_id()
    }

    pub fn mempool_size(&self) -> usize {
        self.inner.components.read().mempool.size()
    }

    pub fn address(&self) -> String {
        self.inner.components.read().wallet.address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsensusParams, GenesisConfig, MiningConfig};

    pub(crate) fn test_config(dir: &std::path::Path) -> NodeConfig {
        let mut consensus = ConsensusParams::default();
        consensus.initial_target_bits = 0;
        consensus.initial_emission = 1_000;
        consensus.coinbase_maturity = 0;
        consensus.block_interval_secs = 1;
        consensus.min_fee = 1;
        NodeConfig {
            data_dir: dir.join("data"),
            key_path: dir.join("keys/miner.toml"),
            mining: MiningConfig {
                enabled: true,
                workers: 1,
                start_time_ms: 0,
                offline_generation: true,
            },
            consensus,
            genesis: GenesisConfig::default(),
        }
    }

    #[tokio::test]
    async fn node_mines_genesis_offline() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(dir.path())).unwrap();
        let handle = node.handle();
        let mut events = handle.subscribe();
        tokio::spawn(node.start());

        let event = tokio::time::timeout(Duration::from_secs(20), events.recv())
            .await
            .expect("mining timed out")
            .expect("events open");
        let NodeEvent::SemanticallySuccessfulModifier(id) = event else {
            panic!("unexpected event {event:?}");
        };
        assert_eq!(handle.best_full_id().unwrap(), Some(id));
        assert_eq!(handle.best_height().unwrap(), 0);
        handle.with_view(|view| {
            assert_eq!(view.state.height(), 0);
            assert!(view.mempool.is_empty());
        });
    }

    #[tokio::test]
    async fn payload_waits_for_its_header() {
        // A second node produces a valid genesis block to feed in.
        let source_dir = tempfile::tempdir().unwrap();
        let source = Node::new(test_config(source_dir.path())).unwrap();
        let genesis = source.handle().generate_block().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.mining.enabled = false;
        let node = Node::new(config).unwrap();
        let handle = node.handle();

        // Payload first: deferred, nothing applied.
        let applied = handle
            .submit_modifier(Modifier::Payload(genesis.payload.clone()))
            .unwrap();
        assert!(applied.is_empty());
        assert_eq!(handle.best_height().unwrap(), -1);

        // Header arrives, the deferred payload follows automatically.
        let applied = handle
            .submit_modifier(Modifier::Header(genesis.header.clone()))
            .unwrap();
        assert_eq!(applied, vec![genesis.id()]);
        assert_eq!(handle.best_height().unwrap(), 0);
        handle.with_view(|view| assert_eq!(view.state.version(), genesis.id()));
    }

    #[tokio::test]
    async fn restart_recovers_chain() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let genesis_id = {
            let node = Node::new(config.clone()).unwrap();
            let handle = node.handle();
            let genesis = handle.generate_block().unwrap();
            handle
                .submit_modifier(Modifier::Header(genesis.header.clone()))
                .unwrap();
            handle
                .submit_modifier(Modifier::Payload(genesis.payload.clone()))
                .unwrap();
            assert_eq!(handle.best_height().unwrap(), 0);
            genesis.id()
        };
        let node = Node::new(config).unwrap();
        let handle = node.handle();
        assert_eq!(handle.best_height().unwrap(), 0);
        assert_eq!(handle.best_full_id().unwrap(), Some(genesis_id));
        handle.with_view(|view| assert_eq!(view.state.version(), genesis_id));
    }
}
