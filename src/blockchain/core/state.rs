use super::chain::Block;
use super::tree::{BlockTree, TreeNode};
use crate::crypto::Sha256Hash;
use crate::error::ChainError;
use crate::mempool::Mempool;
use crate::participant::{Participant, ParticipantRegistry};
use crate::persistence::{CommittedState, Persistence};
use crate::state_table::{AssetStateTable, StateTable, TransactionStateTable};
use crate::sync::{BlockSource, SyncCursor, SyncOutcome};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Default distance between two sync request start heights.
pub const DEFAULT_SYNC_BLOCK_OFFSET: u64 = 10;

/// Snapshot reported to operators and status requests.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChainStatus {
    pub tip_height: Option<u64>,
    pub tip_hash: Option<Sha256Hash>,
    pub frontier_size: usize,
    pub unconfirmed_transactions: usize,
    pub committed_transactions: usize,
    pub assets: Vec<String>,
}

/// Derived state copied before a reorg and put back if it fails.
struct Checkpoint {
    assets: HashMap<String, AssetStateTable>,
    tx_states: TransactionStateTable,
    pool: Mempool,
}

struct Inner {
    tree: BlockTree,
    assets: HashMap<String, AssetStateTable>,
    tx_states: TransactionStateTable,
    pool: Mempool,
    store: Arc<dyn Persistence>,
}

/// The block tree together with everything derived from its canonical chain.
///
/// Every operation takes the one lock around the whole state, so the tip
/// cannot move between reading it and committing a reorg.
pub struct ChainState {
    inner: Mutex<Inner>,
    registry: Arc<ParticipantRegistry>,
    sync_block_offset: u64,
}

impl ChainState {
    /// An empty chain state; nothing is read from `store`.
    pub fn new(store: Arc<dyn Persistence>, registry: Arc<ParticipantRegistry>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tree: BlockTree::new(store.clone()),
                assets: HashMap::new(),
                tx_states: TransactionStateTable::new(),
                pool: Mempool::new(),
                store,
            }),
            registry,
            sync_block_offset: DEFAULT_SYNC_BLOCK_OFFSET,
        }
    }

    /// Rebuilds the tree and the committed state from `store`, appending the
    /// genesis block if the store holds no tree yet.
    pub fn bootstrap(store: Arc<dyn Persistence>, registry: Arc<ParticipantRegistry>) -> Result<Self, ChainError> {
        let tree = BlockTree::restore(store.clone())?;
        let committed = store.load_committed_state()?.unwrap_or_default();
        let assets = committed
            .assets
            .into_iter()
            .map(|table| (table.asset_name().to_string(), table))
            .collect();

        let state = Self {
            inner: Mutex::new(Inner {
                tree,
                assets,
                tx_states: committed.fingerprints,
                pool: Mempool::new(),
                store,
            }),
            registry,
            sync_block_offset: DEFAULT_SYNC_BLOCK_OFFSET,
        };

        if state.inner.lock().tree.is_empty() {
            let genesis = Block::genesis();
            tracing::info!("Empty chain, appending genesis block {}", genesis.hash_str());
            if !state.append_block(genesis) {
                return Err(ChainError::InvalidBlock("Genesis block was rejected".to_string()));
            }
        }
        Ok(state)
    }

    pub fn with_sync_block_offset(mut self, offset: u64) -> Self {
        self.sync_block_offset = offset.max(1);
        self
    }

    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn participant(&self, name: &str) -> Option<&Participant> {
        self.registry.by_name(name)
    }

    pub fn all_other_participants(&self, self_name: &str) -> Vec<Participant> {
        self.registry.all_other(self_name).into_iter().cloned().collect()
    }

    pub fn canonical_tip(&self) -> Option<Block> {
        match self.inner.lock().tree.canonical_tip() {
            Ok(tip) => tip,
            Err(e) => {
                tracing::error!("Failed to read canonical tip: {}", e);
                None
            }
        }
    }

    pub fn tip_height(&self) -> Option<u64> {
        self.canonical_tip().map(|block| block.height())
    }

    pub fn frontier_size(&self) -> usize {
        self.inner.lock().tree.frontier().len()
    }

    /// The block at `height` on the canonical chain.
    pub fn block_at_height(&self, height: u64) -> Option<Block> {
        self.inner.lock().tree.block_at_height(height).unwrap_or_else(|e| {
            tracing::warn!("Failed to look up block at height {}: {}", height, e);
            None
        })
    }

    /// Inserts `block` and brings the derived state in line with the new
    /// canonical tip.
    ///
    /// Returns `false` if the block cannot be linked into the tree or its
    /// transactions cannot be applied; the tree, the state tables and the
    /// unconfirmed pool are then exactly as before the call.
    pub fn append_block(&self, block: Block) -> bool {
        self.inner.lock().append_block(block)
    }

    /// Like [`append_block`](Self::append_block), but only if `block` sits
    /// directly on top of the canonical tip. The check and the append happen
    /// under one lock.
    pub fn append_if_extends_tip(&self, block: Block) -> bool {
        let mut inner = self.inner.lock();
        let tip_height = match inner.tree.canonical_tip_node() {
            Ok(tip) => tip.map(|tip| tip.height()),
            Err(e) => {
                tracing::error!("Failed to read canonical tip: {}", e);
                return false;
            }
        };
        if tip_height.map(|height| height + 1) != Some(block.height()) {
            tracing::debug!("Block at height {} no longer extends the tip", block.height());
            return false;
        }
        inner.append_block(block)
    }

    /// Fetches the chain of the peer that mined `peer_block` and appends it.
    ///
    /// The lock is not held while waiting for the peer.
    pub fn start_sync(&self, peer_block: &Block, source: &dyn BlockSource) -> SyncOutcome {
        let Some(peer) = self.registry.by_name(peer_block.miner()) else {
            tracing::warn!("Cannot sync with unknown miner {}", peer_block.miner());
            return SyncOutcome::UnknownPeer;
        };
        tracing::info!("Start syncing with {}", peer.name);

        let tip_height = self.tip_height().unwrap_or(0);
        for from in SyncCursor::new(tip_height, self.sync_block_offset) {
            let Some(from_block) = self.block_at_height(from) else {
                tracing::warn!("No local block at height {} to sync from", from);
                return SyncOutcome::NoCommonBlock;
            };

            tracing::info!("Requesting blocks from {} starting at height {}", peer.name, from);
            let Some(mut blocks) = source.request_blocks(peer, from, None, from_block.hash()) else {
                tracing::warn!("Sync with {} failed, peer did not answer", peer.name);
                return SyncOutcome::PeerUnavailable;
            };

            if blocks.is_empty() {
                tracing::debug!("Peer {} does not share our block at height {}", peer.name, from);
                continue;
            }

            blocks.sort_by_key(Block::height);
            let appended = blocks.len();
            let mut inner = self.inner.lock();
            for block in blocks {
                let height = block.height();
                if !inner.append_block(block) {
                    tracing::warn!("Block at height {} from {} was rejected during sync", height, peer.name);
                    return SyncOutcome::Rejected { height };
                }
            }
            tracing::info!("Synced {} block(s) from {}", appended, peer.name);
            return SyncOutcome::Synced { appended };
        }

        tracing::warn!("Peer {} shares no block with our chain", peer.name);
        SyncOutcome::NoCommonBlock
    }

    /// Canonical blocks `from..=to` (tip if `to` is `None`) for a peer.
    ///
    /// `None` if the range is invalid or starts beyond the tip. An empty list
    /// if `from_hash` is given and does not match the block at `from`. The
    /// genesis block is never included.
    pub fn serve_sync_request(&self, from: u64, to: Option<u64>, from_hash: Option<Sha256Hash>) -> Option<Vec<Block>> {
        let inner = self.inner.lock();
        let tip = match inner.tree.canonical_tip() {
            Ok(Some(tip)) => tip,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Cannot serve sync request: {}", e);
                return None;
            }
        };

        let to = to.unwrap_or(tip.height());
        if from > to || from > tip.height() {
            tracing::debug!("Rejected sync request for blocks {} to {}", from, to);
            return None;
        }

        let blocks = match inner.tree.canonical_range(from, to) {
            Ok(blocks) => blocks,
            Err(e) => {
                tracing::warn!("Cannot serve sync request: {}", e);
                return None;
            }
        };

        if let (Some(expected), Some(first)) = (from_hash, blocks.first()) {
            if first.hash() != expected {
                return Some(Vec::new());
            }
        }

        Some(blocks.into_iter().filter(|block| !block.is_genesis()).collect())
    }

    pub fn status(&self) -> ChainStatus {
        let inner = self.inner.lock();
        let tip = inner.tree.canonical_tip().ok().flatten();
        let mut assets: Vec<String> = inner.assets.keys().cloned().collect();
        assets.sort();
        ChainStatus {
            tip_height: tip.as_ref().map(Block::height),
            tip_hash: tip.as_ref().map(Block::hash),
            frontier_size: inner.tree.frontier().len(),
            unconfirmed_transactions: inner.pool.len(),
            committed_transactions: inner.tx_states.len(),
            assets,
        }
    }

    /// Adds `tx` to the unconfirmed pool unless it is already queued.
    pub fn add_unconfirmed(&self, tx: Transaction) -> bool {
        self.inner.lock().pool.add_if_absent(tx)
    }

    pub fn remove_unconfirmed(&self, tx: &Transaction) -> bool {
        self.inner.lock().pool.remove(tx)
    }

    pub fn contains_unconfirmed(&self, tx: &Transaction) -> bool {
        self.inner.lock().pool.contains(tx)
    }

    pub fn peek_unconfirmed(&self, count: usize) -> Vec<Transaction> {
        self.inner.lock().pool.peek_up_to(count)
    }

    pub fn unconfirmed_count(&self) -> usize {
        self.inner.lock().pool.len()
    }

    pub fn asset_table(&self, asset_name: &str) -> Option<AssetStateTable> {
        self.inner.lock().assets.get(asset_name).cloned()
    }

    pub fn is_committed(&self, tx: &Transaction) -> bool {
        self.inner.lock().tx_states.contains(&tx.hash())
    }

    /// Picks up to `limit` pooled transactions that would apply on the
    /// current canonical state.
    ///
    /// Any utility transaction makes this a utility-only selection, with at
    /// most one utility transaction per asset; the others stay pooled until
    /// the asset exists and are then dropped. Transfers
    /// are checked per asset as one batch on a scratch copy of the asset
    /// table; a batch containing an invalid transfer is skipped and that
    /// transfer is dropped from the pool. Transfers of assets that do not
    /// exist yet stay pooled. Committed state is never modified.
    pub fn select_mining_candidates(&self, limit: usize) -> Result<Vec<Transaction>, ChainError> {
        let mut inner = self.inner.lock();
        let pending = inner.pool.peek_up_to(limit);

        let mut utility = Vec::new();
        let mut created = HashSet::new();
        for tx in pending.iter().filter(|tx| tx.is_utility()) {
            if inner.tx_states.contains(&tx.hash()) || inner.assets.contains_key(tx.asset_name()) {
                tracing::debug!("Dropping utility transaction {} for existing asset {}", tx.hash_str(), tx.asset_name());
                inner.pool.remove(tx);
            } else if created.insert(tx.asset_name()) {
                utility.push(tx.clone());
            }
        }
        if !utility.is_empty() {
            return Ok(utility);
        }

        let mut by_asset: BTreeMap<&str, Vec<Transaction>> = BTreeMap::new();
        for tx in pending.iter().filter(|tx| !tx.is_utility()) {
            if inner.tx_states.contains(&tx.hash()) {
                inner.pool.remove(tx);
                continue;
            }
            by_asset.entry(tx.asset_name()).or_default().push(tx.clone());
        }

        let mut candidates = Vec::new();
        for (asset_name, group) in by_asset {
            let Some(table) = inner.assets.get(asset_name) else {
                tracing::debug!("Skipping {} transaction(s) for unknown asset {}", group.len(), asset_name);
                continue;
            };
            let mut scratch = table.clone();
            let invalid = scratch.apply_batch(&group)?;
            match invalid.first() {
                None => candidates.extend(group),
                Some(tx) => {
                    tracing::debug!("Dropping invalid transaction {} for asset {}", tx.hash_str(), asset_name);
                    inner.pool.remove(tx);
                }
            }
        }
        Ok(candidates)
    }
}

impl Inner {
    fn append_block(&mut self, block: Block) -> bool {
        let old_tip = match self.tree.canonical_tip_node() {
            Ok(tip) => tip,
            Err(e) => {
                tracing::error!("Failed to read canonical tip: {}", e);
                return false;
            }
        };

        let height = block.height();
        let hash = block.hash_str();
        if let Err(e) = self.tree.append_revertable(block) {
            tracing::warn!("Block {} at height {} rejected: {}", hash, height, e);
            self.revert_tree();
            return false;
        }

        let new_tip = match self.tree.canonical_tip_node() {
            Ok(Some(tip)) => tip,
            Ok(None) | Err(_) => {
                tracing::error!("Tree has no canonical tip after appending block {}", hash);
                self.revert_tree();
                return false;
            }
        };

        let Some(old_tip) = old_tip else {
            tracing::info!("Block added: root {}", hash);
            return true;
        };
        if old_tip.node_ref() == new_tip.node_ref() {
            tracing::info!("Block added: #{} {} (canonical tip unchanged)", height, hash);
            return true;
        }

        let checkpoint = self.checkpoint();
        if let Err(e) = self.process_transactions(&old_tip, &new_tip) {
            match &e {
                ChainError::AtomicTransaction(_) => tracing::error!("Block {} discarded: {}", hash, e),
                _ => tracing::warn!("Block {} discarded: {}", hash, e),
            }
            self.restore(checkpoint);
            self.revert_tree();
            return false;
        }

        self.persist_committed();
        tracing::info!("Block added: #{} {}", height, hash);
        true
    }

    fn revert_tree(&mut self) {
        if let Err(e) = self.tree.revert_last_insertion() {
            tracing::error!("Failed to revert last tree insertion: {}", e);
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            assets: self.assets.clone(),
            tx_states: self.tx_states.clone(),
            pool: self.pool.clone(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.assets = checkpoint.assets;
        self.tx_states = checkpoint.tx_states;
        self.pool = checkpoint.pool;
    }

    /// Reverts the transactions of the abandoned branch and applies those of
    /// the new canonical branch.
    fn process_transactions(&mut self, old_tip: &TreeNode, new_tip: &TreeNode) -> Result<(), ChainError> {
        let ancestor = self.tree.common_ancestor(old_tip, new_tip)?;
        let mut to_revert = self.tree.transactions_between(&ancestor, old_tip)?;
        to_revert.reverse();
        let to_process = self.tree.transactions_between(&ancestor, new_tip)?;

        tracing::debug!(
            "Append requires {} transaction(s) to revert and {} to process",
            to_revert.len(),
            to_process.len()
        );

        let replayed: HashSet<Sha256Hash> = to_process.iter().map(Transaction::hash).collect();
        for tx in &to_revert {
            self.revert_transaction(tx, &replayed)?;
        }
        for tx in &to_process {
            self.apply_transaction(tx)?;
        }

        self.pool.remove_all(&to_process);
        Ok(())
    }

    /// Reverting a utility transaction drops the asset table it created.
    fn revert_transaction(&mut self, tx: &Transaction, replayed: &HashSet<Sha256Hash>) -> Result<(), ChainError> {
        match tx {
            Transaction::Utility(_) => {
                self.assets.remove(tx.asset_name());
            }
            Transaction::Transfer(_) => {
                if let Some(table) = self.assets.get_mut(tx.asset_name()) {
                    if !table.revert(tx) {
                        return Err(ChainError::AtomicTransaction(format!(
                            "Committed transaction {} could not be reverted",
                            tx.hash_str()
                        )));
                    }
                }
            }
        }

        let hash = tx.hash();
        self.tx_states.remove(&hash);
        if !replayed.contains(&hash) {
            self.pool.add_if_absent(tx.clone());
        }
        Ok(())
    }

    fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), ChainError> {
        let hash = tx.hash();
        if self.tx_states.contains(&hash) {
            return Err(ChainError::DoubleCommit(format!(
                "Transaction {} from {} is already in the chain",
                tx.hash_str(),
                tx.sender()
            )));
        }

        match tx {
            Transaction::Utility(utility) => {
                if self.assets.contains_key(&utility.asset_name) {
                    return Err(ChainError::AssetAlreadyExists(utility.asset_name.clone()));
                }
                let table = AssetStateTable::from_utility(utility)?;
                tracing::info!("New asset state table created: {}", utility.asset_name);
                self.assets.insert(utility.asset_name.clone(), table);
            }
            Transaction::Transfer(_) => {
                let table = self
                    .assets
                    .get_mut(tx.asset_name())
                    .ok_or_else(|| ChainError::UnknownAsset(tx.asset_name().to_string()))?;
                if !table.apply(tx) {
                    return Err(ChainError::InvalidTransaction(format!(
                        "Transfer {} of {} {} from {} to {} cannot be applied",
                        tx.hash_str(),
                        tx.amount(),
                        tx.asset_name(),
                        tx.sender(),
                        tx.receiver()
                    )));
                }
            }
        }

        self.tx_states.add(hash);
        self.pool.remove_hash(&hash);
        Ok(())
    }

    fn persist_committed(&self) {
        let mut assets: Vec<AssetStateTable> = self.assets.values().cloned().collect();
        assets.sort_by(|a, b| a.asset_name().cmp(b.asset_name()));
        let snapshot = CommittedState {
            assets,
            fingerprints: self.tx_states.clone(),
        };
        if let Err(e) = self.store.save_committed_state(&snapshot) {
            tracing::error!("Failed to persist committed state: {}", e);
        }
    }
}
