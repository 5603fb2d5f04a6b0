//! End-to-end scenarios driving the full node through its public surface:
//! genesis bootstrap, chain extension, reorganization, mempool conflict
//! handling, rollback windows, and peer sync comparison.

use std::path::Path;
use std::sync::Arc;

use ed25519_dalek::{Keypair, PublicKey, SecretKey};

use cinder_chain::config::{ConsensusParams, GenesisConfig, MiningConfig, NodeConfig};
use cinder_chain::errors::ChainError;
use cinder_chain::history::ChainComparison;
use cinder_chain::node::{Node, NodeHandle};
use cinder_chain::state::StateEngine;
use cinder_chain::storage::VersionedStore;
use cinder_chain::types::transaction::{Directive, Unlocker};
use cinder_chain::types::{Block, Modifier, Proposition, SyncInfo};
use cinder_chain::wallet::Wallet;

fn test_config(dir: &Path, emission: u64) -> NodeConfig {
    let mut consensus = ConsensusParams::default();
    // Trivial PoW so block generation is instantaneous and deterministic.
    consensus.initial_target_bits = 0;
    consensus.initial_emission = emission;
    consensus.coinbase_maturity = 0;
    consensus.min_fee = 1;
    NodeConfig {
        data_dir: dir.join("data"),
        key_path: dir.join("keys/miner.toml"),
        mining: MiningConfig {
            enabled: false,
            workers: 1,
            start_time_ms: 0,
            offline_generation: true,
        },
        consensus,
        genesis: GenesisConfig::default(),
    }
}

fn keypair(seed: u8) -> Keypair {
    let secret = SecretKey::from_bytes(&[seed; 32]).expect("secret");
    let public = PublicKey::from(&secret);
    Keypair { secret, public }
}

fn feed_block(handle: &NodeHandle, block: &Block) -> Vec<cinder_chain::types::ModifierId> {
    let mut applied = handle
        .submit_modifier(Modifier::Header(block.header.clone()))
        .unwrap();
    applied.extend(
        handle
            .submit_modifier(Modifier::Payload(block.payload.clone()))
            .unwrap(),
    );
    applied
}

fn mine_and_apply(handle: &NodeHandle) -> Block {
    let block = handle.generate_block().unwrap();
    let applied = feed_block(handle, &block);
    assert!(applied.contains(&block.id()), "mined block must apply");
    block
}

#[test]
fn genesis_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 2_000);
    let supply = config.consensus.supply_at(0);
    let node = Node::new(config).unwrap();
    let handle = node.handle();

    let genesis = handle.generate_block().unwrap();
    assert_eq!(genesis.header.height, 0);
    assert!(genesis.header.parent_id.is_zero());
    assert_eq!(genesis.payload.transactions.len(), 1);
    let coinbase = &genesis.payload.transactions[0];
    assert!(coinbase.is_coinbase());
    match coinbase.directives[0] {
        Directive::Coinbase { amount, height } => {
            assert_eq!(amount, supply);
            assert_eq!(height, 0);
        }
        _ => panic!("expected a coinbase directive"),
    }

    feed_block(&handle, &genesis);
    assert_eq!(handle.best_height().unwrap(), 0);
    assert_eq!(handle.best_full_id().unwrap(), Some(genesis.id()));
    handle.with_view(|view| {
        assert_eq!(view.state.height(), 0);
        assert_eq!(view.state.digest(), genesis.header.state_root);
        let coinbase_box = &genesis.payload.transactions[0].outputs(0)[0];
        assert_eq!(
            view.state.box_by_id(&coinbase_box.id()).unwrap().as_ref(),
            Some(coinbase_box)
        );
    });
}

#[test]
fn simple_extension_with_payment() {
    let dir = tempfile::tempdir().unwrap();
    // Emission of 100 so the single coinbase box carries exactly 100.
    let node = Node::new(test_config(dir.path(), 100)).unwrap();
    let handle = node.handle();
    let genesis = mine_and_apply(&handle);

    let spender = Wallet::from_keypair(keypair(7));
    let recipient = keypair(8);
    let genesis_box = genesis.payload.transactions[0].outputs(0)[0].clone();

    // 100 in, 90 out + 0 change, fee 10.
    let payment = spender.create_transaction(
        10,
        genesis.header.timestamp + 1,
        vec![Unlocker {
            box_id: genesis_box.id(),
            proof: None,
        }],
        vec![
            Directive::Transfer {
                proposition: Proposition::PublicKey(recipient.public.to_bytes()),
                amount: 90,
                token_id: None,
            },
            Directive::Transfer {
                proposition: Proposition::PublicKey(spender.public_key()),
                amount: 0,
                token_id: None,
            },
        ],
    );
    handle.submit_transaction(payment.clone()).unwrap();
    assert_eq!(handle.mempool_size(), 1);

    let block = mine_and_apply(&handle);
    assert_eq!(block.header.height, 1);
    assert_eq!(block.payload.transactions.len(), 2);

    assert_eq!(handle.mempool_size(), 0);
    handle.with_view(|view| {
        assert_eq!(view.state.height(), 1);
        let recipient_box = payment.outputs(0)[0].clone();
        assert_eq!(
            view.state.box_by_id(&recipient_box.id()).unwrap(),
            Some(recipient_box)
        );
        // The spent genesis box is gone.
        assert_eq!(view.state.box_by_id(&genesis_box.id()).unwrap(), None);
    });
}

#[test]
fn reorganization_switches_to_heavier_chain() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let node_a = Node::new(test_config(dir_a.path(), 500)).unwrap();
    let node_b = Node::new(test_config(dir_b.path(), 500)).unwrap();
    let handle_a = node_a.handle();
    let handle_b = node_b.handle();

    // Shared genesis, then the nodes diverge.
    let genesis = mine_and_apply(&handle_a);
    feed_block(&handle_b, &genesis);

    let chain_a: Vec<Block> = (0..2).map(|_| mine_and_apply(&handle_a)).collect();
    let chain_b: Vec<Block> = (0..3).map(|_| mine_and_apply(&handle_b)).collect();
    assert_eq!(handle_a.best_height().unwrap(), 2);

    // Chain B arrives at node A, fully validated, with more cumulative work.
    for block in &chain_b {
        feed_block(&handle_a, block);
    }

    assert_eq!(handle_a.best_height().unwrap(), 3);
    assert_eq!(
        handle_a.best_full_id().unwrap(),
        Some(chain_b[2].id())
    );
    handle_a.with_view(|view| {
        assert_eq!(view.state.version(), chain_b[2].id());
        // Boxes created on the losing branch are gone.
        for block in &chain_a {
            for tx in &block.payload.transactions {
                for output in tx.outputs(0) {
                    assert_eq!(view.state.box_by_id(&output.id()).unwrap(), None);
                }
            }
        }
        // The winning branch's latest coinbase box is live.
        let winning = chain_b[2].payload.transactions[0].outputs(0)[0].clone();
        assert_eq!(view.state.box_by_id(&winning.id()).unwrap(), Some(winning));
    });
}

#[test]
fn double_spend_rejected_in_mempool() {
    let dir = tempfile::tempdir().unwrap();
    let node = Node::new(test_config(dir.path(), 100)).unwrap();
    let handle = node.handle();
    let genesis = mine_and_apply(&handle);
    let genesis_box = genesis.payload.transactions[0].outputs(0)[0].clone();

    let wallet_one = Wallet::from_keypair(keypair(11));
    let wallet_two = Wallet::from_keypair(keypair(12));
    let spend = |wallet: &Wallet, amount: u64| {
        wallet.create_transaction(
            10,
            genesis.header.timestamp + 1,
            vec![Unlocker {
                box_id: genesis_box.id(),
                proof: None,
            }],
            vec![Directive::Transfer {
                proposition: Proposition::PublicKey(wallet.public_key()),
                amount,
                token_id: None,
            }],
        )
    };

    handle.submit_transaction(spend(&wallet_one, 90)).unwrap();
    let err = handle
        .submit_transaction(spend(&wallet_two, 80))
        .unwrap_err();
    assert!(matches!(err, ChainError::SemanticInvalid(_)));
    assert_eq!(handle.mempool_size(), 1);
}

#[test]
fn rollback_window_exceeded() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 500);
    let node = Node::new(config.clone()).unwrap();
    let handle = node.handle();

    let blocks: Vec<Block> = (0..15).map(|_| mine_and_apply(&handle)).collect();

    // Replay the chain into a standalone state engine with a 10-version
    // window.
    let replay_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        VersionedStore::open(replay_dir.path(), config.consensus.keep_versions).unwrap(),
    );
    let mut engine = StateEngine::open(store, config.consensus.clone()).unwrap();
    for block in &blocks {
        engine.apply_block(block).unwrap();
    }
    assert_eq!(engine.height(), 14);
    assert_eq!(engine.rollback_versions().unwrap().len(), 10);

    let digest = engine.digest();
    let err = engine.rollback_to(&blocks[1].id()).unwrap_err();
    assert!(matches!(err, ChainError::NotApplicable(_)));
    assert_eq!(engine.digest(), digest);

    // A target inside the window still works.
    engine.rollback_to(&blocks[12].id()).unwrap();
    assert_eq!(engine.height(), 12);
}

#[test]
fn sync_comparison_between_peers() {
    let dir = tempfile::tempdir().unwrap();
    let node = Node::new(test_config(dir.path(), 500)).unwrap();
    let handle = node.handle();

    let genesis = mine_and_apply(&handle);
    let chain: Vec<Block> = (0..3).map(|_| mine_and_apply(&handle)).collect();

    // Remote knows [g, a1]; we are at [g, a1, a2, a3].
    let remote = SyncInfo::new(false, vec![genesis.id(), chain[0].id()]);
    assert_eq!(handle.compare(&remote).unwrap(), ChainComparison::Older);

    let continuation = handle.continuation_ids(&remote, 2).unwrap().unwrap();
    assert_eq!(continuation, vec![chain[1].id(), chain[2].id()]);

    // Our own sync info ends at our tip.
    let ours = handle.sync_info(false).unwrap();
    assert_eq!(ours.tip(), Some(&chain[2].id()));
    assert_eq!(
        handle.compare(&ours).unwrap(),
        ChainComparison::Equal
    );
}
