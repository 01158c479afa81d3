//! Integration tests for restoring chain state from SQLite storage

use forkledger::blockchain::{Block, ChainState};
use forkledger::config::{Config, ParticipantConfig};
use forkledger::crypto::KeyPair;
use forkledger::node::Node;
use forkledger::participant::{Participant, ParticipantRegistry};
use forkledger::persistence::{Database, Persistence};
use forkledger::transaction::{ParticipantShare, Transaction, TransferTx, UtilityTx};
use std::sync::Arc;
use tempfile::TempDir;

fn registry(alice: &KeyPair) -> Arc<ParticipantRegistry> {
    let mut registry = ParticipantRegistry::new();
    registry
        .register(Participant::new("alice", alice.public_key_bytes().to_vec(), "127.0.0.1", 9001))
        .unwrap();
    registry
        .register(Participant::new("bob", KeyPair::generate().public_key_bytes().to_vec(), "127.0.0.1", 9002))
        .unwrap();
    Arc::new(registry)
}

fn open(dir: &TempDir) -> Result<Arc<dyn Persistence>, Box<dyn std::error::Error>> {
    let path = dir.path().join("chainstate.db");
    Ok(Arc::new(Database::open(path.to_str().unwrap())?))
}

fn block(parent: &Block, txs: Vec<Transaction>, timestamp: i64) -> Block {
    Block::new(parent.height() + 1, parent.hash(), "alice", 0, txs).with_timestamp(timestamp)
}

fn energy(registry: &ParticipantRegistry) -> Transaction {
    let alice = registry.by_name("alice").unwrap().clone();
    let bob = registry.by_name("bob").unwrap().clone();
    UtilityTx::new(
        "alice",
        "energy",
        vec![alice.clone(), bob],
        vec![ParticipantShare {
            participant: alice,
            share: 100,
        }],
    )
    .with_timestamp(1)
    .into()
}

fn transfer(amount: i64, timestamp: i64) -> Transaction {
    TransferTx::new("alice", "bob", "energy", amount)
        .with_timestamp(timestamp)
        .into()
}

#[test]
fn test_chain_state_survives_restart() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let alice = KeyPair::generate();
    let registry = registry(&alice);

    let (tip, frontier, status) = {
        let chain = ChainState::bootstrap(open(&dir)?, registry.clone())?;
        let genesis = chain.canonical_tip().unwrap();
        let b1 = block(&genesis, vec![energy(&registry)], 10);
        let b2 = block(&b1, vec![transfer(25, 20)], 20);
        let fork = block(&b1, vec![transfer(35, 21)], 21);
        assert!(chain.append_block(b1));
        assert!(chain.append_block(b2));
        assert!(chain.append_block(fork));
        (chain.canonical_tip(), chain.frontier_size(), chain.status())
    };

    let restored = ChainState::bootstrap(open(&dir)?, registry.clone())?;
    assert_eq!(restored.canonical_tip(), tip);
    assert_eq!(restored.frontier_size(), frontier);
    assert_eq!(restored.status().assets, status.assets);
    assert_eq!(restored.status().committed_transactions, status.committed_transactions);
    assert_eq!(restored.asset_table("energy").unwrap().total_supply(), 100);

    // The restored tree keeps extending where it left off.
    let tip = restored.canonical_tip().unwrap();
    let next = block(&tip, Vec::new(), 30);
    assert!(restored.append_block(next.clone()));
    assert_eq!(restored.canonical_tip(), Some(next));
    Ok(())
}

#[test]
fn test_rejected_block_leaves_storage_untouched() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let registry = registry(&KeyPair::generate());

    {
        let chain = ChainState::bootstrap(open(&dir)?, registry.clone())?;
        let genesis = chain.canonical_tip().unwrap();
        let b1 = block(&genesis, vec![energy(&registry)], 10);
        assert!(chain.append_block(b1.clone()));
        assert!(!chain.append_block(block(&b1, vec![transfer(1_000, 20)], 20)));
    }

    let store = open(&dir)?;
    assert_eq!(store.max_height()?, Some(1));
    let restored = ChainState::bootstrap(store, registry)?;
    assert_eq!(restored.tip_height(), Some(1));
    assert_eq!(restored.asset_table("energy").unwrap().balance("alice"), Some(100));
    Ok(())
}

#[tokio::test]
async fn test_node_init_creates_and_reuses_data_dir() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let alice = KeyPair::generate();

    let mut config = Config::default();
    config.node.name = "alice".to_string();
    config.node.secret_key = Some(alice.secret_hex());
    config.node.data_dir = dir.path().join("node").to_string_lossy().into_owned();
    config.miner.difficulty = 1;
    config
        .participants
        .push(ParticipantConfig::from_keypair("alice", &alice, "127.0.0.1", 9001));

    {
        let node = Node::init(config.clone())?;
        assert_eq!(node.chain().tip_height(), Some(0));
        let mined = node.miner().mine_block()?.unwrap();
        assert!(node.miner().submit_mined_block(mined));
    }

    assert!(config.database_path().exists());
    let node = Node::init(config)?;
    assert_eq!(node.chain().tip_height(), Some(1));
    assert_eq!(node.chain().block_at_height(0), Some(Block::genesis()));
    Ok(())
}
