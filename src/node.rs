use crate::blockchain::{Block, ChainState};
use crate::codec::{MessageCodec, WireMessage};
use crate::config::Config;
use crate::error::ChainError;
use crate::miner::{Broadcast, Miner, MinerIdentity};
use crate::network::{serve, MessageHandler, Outbound, SyncClient};
use crate::participant::{Participant, ParticipantRegistry};
use crate::persistence::{Database, Persistence};
use crate::sync::SyncOutcome;
use crate::transaction::Transaction;
use parking_lot::RwLock;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Booting,
    Syncing,
    Ready,
}

/// Sends blocks and transactions to every participant except this node.
pub struct PeerBroadcast {
    outbound: Arc<Outbound>,
    peers: Vec<Participant>,
}

impl PeerBroadcast {
    pub fn new(outbound: Arc<Outbound>, peers: Vec<Participant>) -> Self {
        Self { outbound, peers }
    }

    fn send_all(&self, message: &WireMessage) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Cannot encode {}: {}", message.kind(), e);
                return;
            }
        };
        for peer in &self.peers {
            self.outbound.send_to(peer, payload.clone());
        }
    }

    pub fn broadcast_transaction(&self, tx: &Transaction) {
        self.send_all(&WireMessage::Transaction(tx.clone()));
    }
}

impl Broadcast for PeerBroadcast {
    fn broadcast_block(&self, block: &Block) {
        debug!("Broadcasting block {} to {} peer(s)", block.hash_str(), self.peers.len());
        self.send_all(&WireMessage::Block(block.clone()));
    }
}

/// A running ledger participant: chain state, miner and peer transport.
pub struct Node {
    config: Config,
    chain: Arc<ChainState>,
    codec: MessageCodec,
    broadcast: Arc<PeerBroadcast>,
    sync_client: SyncClient,
    miner: Arc<Miner>,
    state: RwLock<NodeState>,
}

impl Node {
    /// Opens the on-disk store under `node.data_dir` and builds the node.
    /// Must be called from within a tokio runtime.
    pub fn init(config: Config) -> Result<Arc<Self>, ChainError> {
        fs::create_dir_all(&config.node.data_dir).map_err(|e| {
            ChainError::IoError(format!("Failed to create data dir {}: {}", config.node.data_dir, e))
        })?;
        let db_path = config.database_path();
        let db_path = db_path
            .to_str()
            .ok_or_else(|| ChainError::ConfigError(format!("Non UTF-8 database path {:?}", db_path)))?;
        let store: Arc<dyn Persistence> = Arc::new(Database::open(db_path)?);
        Self::with_store(config, store)
    }

    /// Builds the node over an already opened store.
    pub fn with_store(config: Config, store: Arc<dyn Persistence>) -> Result<Arc<Self>, ChainError> {
        let runtime = Handle::try_current()
            .map_err(|e| ChainError::NodeNotInitialized(format!("No async runtime: {}", e)))?;
        let registry: Arc<ParticipantRegistry> = Arc::new(config.registry()?);
        let name = config.node.name.clone();
        if registry.by_name(&name).is_none() {
            warn!("Node {} is not among the configured participants", name);
        }

        let chain = Arc::new(
            ChainState::bootstrap(store, registry.clone())?
                .with_sync_block_offset(config.sync.block_request_offset),
        );
        let codec = MessageCodec::new(registry, config.miner.difficulty);

        let outbound = Arc::new(Outbound::new(runtime, config.sync.socket_timeout));
        let broadcast = Arc::new(PeerBroadcast::new(outbound, chain.all_other_participants(&name)));

        let identity = config
            .keypair()?
            .map(|keypair| MinerIdentity::new(name.clone(), keypair));
        if identity.is_none() {
            warn!("No node.secret_key configured, this node will not mine");
        }
        let miner = Arc::new(
            Miner::new(chain.clone(), identity, config.miner.clone()).with_broadcast(broadcast.clone()),
        );

        let sync_client = SyncClient::new(
            codec.clone(),
            name,
            config.sync.socket_timeout,
            config.sync.request_timeout,
        );

        Ok(Arc::new(Self {
            config,
            chain,
            codec,
            broadcast,
            sync_client,
            miner,
            state: RwLock::new(NodeState::Booting),
        }))
    }

    pub fn chain(&self) -> &Arc<ChainState> {
        &self.chain
    }

    pub fn miner(&self) -> &Arc<Miner> {
        &self.miner
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    fn mining_enabled(&self) -> bool {
        self.config.miner.enabled && self.config.node.secret_key.is_some()
    }

    /// Binds the peer listener, starts the miner and serves peers until the
    /// listener fails.
    pub async fn start(self: Arc<Self>) -> Result<(), ChainError> {
        let bind = format!("0.0.0.0:{}", self.config.node.listen_port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| ChainError::NetworkError(format!("Port {} unavailable: {}", self.config.node.listen_port, e)))?;
        self.run(listener).await
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), ChainError> {
        let status = self.chain.status();
        info!(
            "Node {} ready at height {:?} with {} participant(s)",
            self.config.node.name,
            status.tip_height,
            self.chain.registry().len()
        );
        *self.state.write() = NodeState::Ready;

        if self.mining_enabled() {
            self.miner.start()?;
        }

        let chain = self.chain.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(STATUS_LOG_INTERVAL).await;
                let status = chain.status();
                info!(
                    "Chain height {:?}, {} fork tip(s), {} unconfirmed transaction(s)",
                    status.tip_height, status.frontier_size, status.unconfirmed_transactions
                );
            }
        });

        let handler: Arc<dyn MessageHandler> = self.clone();
        let result = serve(listener, handler).await;
        self.miner.shutdown();
        result
    }

    /// Appends a block from a peer, falling back to a sync with its miner if
    /// the block does not link into the local tree.
    pub fn handle_block(&self, block: Block) {
        let tip_height = self.chain.tip_height().unwrap_or(0);
        if block.height() <= tip_height {
            info!(
                "Block {} at height {} discarded, not longer than local chain at {}",
                block.hash_str(),
                block.height(),
                tip_height
            );
            return;
        }

        info!("Block {} at height {} received from {}", block.hash_str(), block.height(), block.miner());
        if self.chain.append_block(block.clone()) {
            return;
        }

        {
            let mut state = self.state.write();
            if *state == NodeState::Syncing {
                debug!("Sync already running, ignoring block {}", block.hash_str());
                return;
            }
            *state = NodeState::Syncing;
        }

        let was_mining = self.miner.is_running();
        self.miner.shutdown();
        let outcome = self.chain.start_sync(&block, &self.sync_client);
        match outcome {
            SyncOutcome::Synced { appended } => info!("Sync with {} appended {} block(s)", block.miner(), appended),
            other => warn!("Sync with {} ended without progress: {:?}", block.miner(), other),
        }
        *self.state.write() = NodeState::Ready;

        if was_mining {
            if let Err(e) = self.miner.start() {
                error!("Failed to restart miner: {}", e);
            }
        }
    }

    /// Pools a verified transaction; external submissions are passed on to
    /// every other participant.
    pub fn handle_transaction(&self, tx: Transaction) {
        if self.chain.is_committed(&tx) {
            debug!("Transaction {} already committed", tx.hash_str());
            return;
        }
        info!(
            "Transaction received: {} -> {} {} {}",
            tx.sender(),
            tx.receiver(),
            tx.amount(),
            tx.asset_name()
        );

        let added = self.chain.add_unconfirmed(tx.clone());
        if added && tx.is_external() {
            let mut forwarded = tx;
            forwarded.set_external(false);
            self.broadcast.broadcast_transaction(&forwarded);
        }
    }
}

impl MessageHandler for Node {
    fn handle(&self, message: WireMessage) -> Option<WireMessage> {
        match message {
            WireMessage::Block(block) => {
                if let Some(block) = self.codec.verify_block(block) {
                    self.handle_block(block);
                }
                None
            }
            WireMessage::Transaction(tx) => {
                if let Some(tx) = self.codec.verify_transaction(tx) {
                    self.handle_transaction(tx);
                }
                None
            }
            WireMessage::SyncRequest {
                from,
                to,
                from_hash,
                sending_node,
            } => {
                debug!("Sync request from {} for blocks {}..{:?}", sending_node, from, to);
                self.chain
                    .serve_sync_request(from, to, from_hash)
                    .map(WireMessage::SyncResponse)
            }
            WireMessage::StatusRequest => Some(WireMessage::StatusResponse(self.chain.status())),
            other => {
                warn!("Unexpected {} from a peer", other.kind());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParticipantConfig;
    use crate::crypto::KeyPair;
    use crate::persistence::InMemoryPersistence;
    use crate::transaction::TransferTx;

    fn config(name: &str, keypair: &KeyPair, others: &[(&str, &KeyPair)]) -> Config {
        let mut config = Config::default();
        config.node.name = name.to_string();
        config.node.secret_key = Some(keypair.secret_hex());
        config.miner.enabled = false;
        config.miner.difficulty = 0;
        config.participants.push(ParticipantConfig::from_keypair(name, keypair, "127.0.0.1", 1));
        for (other, key) in others {
            config.participants.push(ParticipantConfig::from_keypair(*other, key, "127.0.0.1", 1));
        }
        config
    }

    fn mined(mut block: Block, keypair: &KeyPair) -> Block {
        while !block.meets_target() {
            block.increment_nonce();
        }
        block.sign(keypair);
        block
    }

    #[tokio::test]
    async fn test_node_answers_status_and_sync_requests() {
        let alice = KeyPair::generate();
        let node = Node::with_store(config("alice", &alice, &[]), Arc::new(InMemoryPersistence::new())).unwrap();
        assert_eq!(node.state(), NodeState::Booting);

        let block = node.miner().mine_block().unwrap().unwrap();
        assert!(node.miner().submit_mined_block(block.clone()));

        match node.handle(WireMessage::StatusRequest) {
            Some(WireMessage::StatusResponse(status)) => assert_eq!(status.tip_height, Some(1)),
            other => panic!("unexpected reply {:?}", other),
        }

        let reply = node.handle(WireMessage::SyncRequest {
            from: 0,
            to: None,
            from_hash: Some(Block::genesis().hash()),
            sending_node: "bob".to_string(),
        });
        assert_eq!(reply, Some(WireMessage::SyncResponse(vec![block])));

        let refused = node.handle(WireMessage::SyncRequest {
            from: 5,
            to: None,
            from_hash: None,
            sending_node: "bob".to_string(),
        });
        assert!(refused.is_none());
    }

    #[tokio::test]
    async fn test_node_appends_valid_peer_block() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let node = Node::with_store(config("alice", &alice, &[("bob", &bob)]), Arc::new(InMemoryPersistence::new())).unwrap();

        let block = mined(Block::new(1, Block::genesis().hash(), "bob", 0, Vec::new()).with_timestamp(7), &bob);
        assert!(node.handle(WireMessage::Block(block.clone())).is_none());
        assert_eq!(node.chain().canonical_tip(), Some(block.clone()));

        // Same height again is not longer than the local chain.
        let rival = mined(Block::new(1, Block::genesis().hash(), "bob", 0, Vec::new()).with_timestamp(8), &bob);
        node.handle(WireMessage::Block(rival));
        assert_eq!(node.chain().frontier_size(), 1);

        // Forged signature never reaches the chain.
        let forged = mined(Block::new(2, block.hash(), "bob", 0, Vec::new()), &KeyPair::generate());
        node.handle(WireMessage::Block(forged));
        assert_eq!(node.chain().tip_height(), Some(1));
    }

    #[tokio::test]
    async fn test_node_pools_signed_transactions_only() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let node = Node::with_store(config("alice", &alice, &[("bob", &bob)]), Arc::new(InMemoryPersistence::new())).unwrap();

        let mut tx: Transaction = TransferTx::new("bob", "alice", "energy", 4).external().into();
        tx.sign(&bob);
        node.handle(WireMessage::Transaction(tx.clone()));
        assert!(node.chain().contains_unconfirmed(&tx));

        let mut forged: Transaction = TransferTx::new("bob", "alice", "energy", 9).into();
        forged.sign(&alice);
        node.handle(WireMessage::Transaction(forged.clone()));
        assert!(!node.chain().contains_unconfirmed(&forged));
        assert_eq!(node.chain().unconfirmed_count(), 1);
    }

    #[tokio::test]
    async fn test_unlinkable_block_with_unreachable_miner_leaves_chain_intact() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut cfg = config("alice", &alice, &[("bob", &bob)]);
        cfg.sync.socket_timeout = Duration::from_millis(200);
        cfg.sync.request_timeout = Duration::from_millis(200);
        let node = Node::with_store(cfg, Arc::new(InMemoryPersistence::new())).unwrap();

        let orphan = mined(Block::new(3, [9u8; 32], "bob", 0, Vec::new()), &bob);
        let handler = node.clone();
        tokio::task::spawn_blocking(move || handler.handle_block(orphan)).await.unwrap();

        assert_eq!(node.chain().tip_height(), Some(0));
        assert_eq!(node.state(), NodeState::Ready);
    }
}
