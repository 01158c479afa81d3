use super::chain::Block;
use crate::error::ChainError;
use crate::persistence::Persistence;
use crate::transaction::Transaction;
use std::sync::Arc;

/// Storage key of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub height: u64,
    pub id: u64,
}

/// One block in the tree with numeric links to its parent and children.
///
/// Parent and children are node ids; the parent lives one height below and
/// every child one height above, so the id is enough to load them.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TreeNode {
    pub id: u64,
    pub block: Block,
    pub parent: Option<u64>,
    pub children: Vec<u64>,
}

impl TreeNode {
    pub fn new(id: u64, block: Block, parent: Option<u64>) -> Self {
        Self {
            id,
            block,
            parent,
            children: Vec::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.block.height()
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef {
            height: self.height(),
            id: self.id,
        }
    }
}

/// What `revert_last_insertion` needs to undo the last revertable append.
#[derive(Debug, Clone)]
struct RevertPoint {
    frontier: Vec<NodeRef>,
    inserted: Vec<NodeRef>,
}

/// Fork-aware tree of blocks.
///
/// The frontier holds every node at the greatest height reached so far; the
/// canonical tip is the frontier block with the numerically smallest hash.
pub struct BlockTree {
    store: Arc<dyn Persistence>,
    root: Option<NodeRef>,
    frontier: Vec<NodeRef>,
    next_id: u64,
    revert_point: Option<RevertPoint>,
}

impl BlockTree {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self {
            store,
            root: None,
            frontier: Vec::new(),
            next_id: 0,
            revert_point: None,
        }
    }

    /// Rebuilds root, frontier and id counter from the nodes already stored.
    pub fn restore(store: Arc<dyn Persistence>) -> Result<Self, ChainError> {
        let mut tree = Self::new(store);

        let Some(max_height) = tree.store.max_height()? else {
            return Ok(tree);
        };

        let roots = tree.store.list_node_ids(0)?;
        let root_id = match roots.as_slice() {
            [id] => *id,
            [] => {
                return Err(ChainError::DatabaseError(
                    "Stored tree has nodes but no root".to_string(),
                ))
            }
            _ => {
                return Err(ChainError::DatabaseError(format!(
                    "Stored tree has {} root nodes",
                    roots.len()
                )))
            }
        };
        tree.root = Some(NodeRef { height: 0, id: root_id });

        tree.frontier = tree
            .store
            .list_node_ids(max_height)?
            .into_iter()
            .map(|id| NodeRef { height: max_height, id })
            .collect();

        tree.next_id = tree.store.max_node_id()?.map_or(0, |id| id + 1);

        tracing::info!(
            "Restored block tree at height {} with {} frontier node(s)",
            max_height,
            tree.frontier.len()
        );
        Ok(tree)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn root(&self) -> Option<NodeRef> {
        self.root
    }

    pub fn frontier(&self) -> &[NodeRef] {
        &self.frontier
    }

    pub fn frontier_height(&self) -> Option<u64> {
        self.frontier.first().map(|r| r.height)
    }

    pub fn load(&self, node: NodeRef) -> Result<TreeNode, ChainError> {
        self.store.load_node(node.height, node.id)?.ok_or_else(|| {
            ChainError::DatabaseError(format!(
                "Tree node {} at height {} is missing from storage",
                node.id, node.height
            ))
        })
    }

    pub fn parent_of(&self, node: &TreeNode) -> Result<Option<TreeNode>, ChainError> {
        match node.parent {
            Some(id) => self
                .load(NodeRef {
                    height: node.height() - 1,
                    id,
                })
                .map(Some),
            None => Ok(None),
        }
    }

    fn require_parent(&self, node: &TreeNode) -> Result<TreeNode, ChainError> {
        self.parent_of(node)?.ok_or_else(|| {
            ChainError::InvalidChainOrder(format!(
                "Walked past the root from block {}",
                node.block.hash_str()
            ))
        })
    }

    pub fn nodes_at_height(&self, height: u64) -> Result<Vec<TreeNode>, ChainError> {
        self.store
            .list_node_ids(height)?
            .into_iter()
            .map(|id| self.load(NodeRef { height, id }))
            .collect()
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn attach(&mut self, parent: &mut TreeNode, block: Block) -> Result<NodeRef, ChainError> {
        let child = TreeNode::new(self.allocate_id(), block, Some(parent.id));
        self.store.save_node(&child)?;
        parent.children.push(child.id);
        self.store.save_node(parent)?;
        Ok(child.node_ref())
    }

    /// Inserts `block` and returns the node holding it.
    ///
    /// Fails with [`ChainError::InvalidChainOrder`] when the tree is empty
    /// and the block is not a root, when the block skips heights, or when
    /// no node one height below carries its previous hash.
    pub fn append_by_height(&mut self, block: Block) -> Result<NodeRef, ChainError> {
        self.insert(block).map(|(node, _)| node)
    }

    /// Like [`append_by_height`](Self::append_by_height) but remembers the
    /// frontier and the created nodes so the insertion can be undone.
    pub fn append_revertable(&mut self, block: Block) -> Result<NodeRef, ChainError> {
        self.revert_point = Some(RevertPoint {
            frontier: self.frontier.clone(),
            inserted: Vec::new(),
        });
        let (node, inserted) = self.insert(block)?;
        if let Some(point) = self.revert_point.as_mut() {
            point.inserted = inserted;
        }
        Ok(node)
    }

    /// Restores the frontier saved by the last revertable append and deletes
    /// the nodes it created. Does nothing if there is nothing to revert.
    pub fn revert_last_insertion(&mut self) -> Result<(), ChainError> {
        let Some(point) = self.revert_point.take() else {
            return Ok(());
        };
        self.frontier = point.frontier;

        for node_ref in point.inserted.iter().rev() {
            let node = self.load(*node_ref)?;
            match self.parent_of(&node)? {
                Some(mut parent) => {
                    parent.children.retain(|id| *id != node.id);
                    self.store.save_node(&parent)?;
                }
                None => self.root = None,
            }
            self.store.delete_node(node_ref.height, node_ref.id)?;
            tracing::debug!("Reverted insertion of block {} at height {}", node.block.hash_str(), node_ref.height);
        }
        Ok(())
    }

    /// Returns the node for `block` and the nodes newly created for it.
    fn insert(&mut self, block: Block) -> Result<(NodeRef, Vec<NodeRef>), ChainError> {
        let height = block.height();

        let Some(frontier_height) = self.frontier_height() else {
            if height != 0 {
                return Err(ChainError::InvalidChainOrder(format!(
                    "Tree is empty, expected a root block but got height {}",
                    height
                )));
            }
            let root = TreeNode::new(self.allocate_id(), block, None);
            self.store.save_node(&root)?;
            let root_ref = root.node_ref();
            self.root = Some(root_ref);
            self.frontier = vec![root_ref];
            return Ok((root_ref, vec![root_ref]));
        };

        if height == frontier_height + 1 {
            let mut created = Vec::new();
            for parent_ref in self.frontier.clone() {
                let mut parent = self.load(parent_ref)?;
                if parent.block.hash() == *block.previous_hash() {
                    created.push(self.attach(&mut parent, block.clone())?);
                }
            }
            let Some(first) = created.first().copied() else {
                return Err(ChainError::InvalidChainOrder(format!(
                    "Block {} at height {} does not extend any chain tip",
                    block.hash_str(),
                    height
                )));
            };
            tracing::debug!("Block {} extends the longest chain to height {}", block.hash_str(), height);
            self.frontier = created.clone();
            return Ok((first, created));
        }

        if height > frontier_height {
            return Err(ChainError::InvalidChainOrder(format!(
                "Block height {} is beyond the longest chain at height {}",
                height, frontier_height
            )));
        }

        let hash = block.hash();
        if let Some(existing) = self
            .nodes_at_height(height)?
            .into_iter()
            .find(|node| node.block.hash() == hash)
        {
            return Ok((existing.node_ref(), Vec::new()));
        }

        if height == 0 {
            return Err(ChainError::InvalidChainOrder(
                "Tree already has a different root".to_string(),
            ));
        }

        let Some(mut parent) = self
            .nodes_at_height(height - 1)?
            .into_iter()
            .find(|node| node.block.hash() == *block.previous_hash())
        else {
            return Err(ChainError::InvalidChainOrder(format!(
                "No matching parent found for block {} at height {}",
                block.hash_str(),
                height
            )));
        };

        let node = self.attach(&mut parent, block)?;
        if height == frontier_height {
            tracing::debug!("Block at height {} ties the longest chain", height);
            self.frontier.push(node);
        } else {
            tracing::debug!("Block at height {} attached to a side branch", height);
        }
        Ok((node, vec![node]))
    }

    pub fn canonical_tip_node(&self) -> Result<Option<TreeNode>, ChainError> {
        let mut best: Option<TreeNode> = None;
        for node_ref in &self.frontier {
            let node = self.load(*node_ref)?;
            let better = match &best {
                Some(current) => node.block.hash() < current.block.hash(),
                None => true,
            };
            if better {
                best = Some(node);
            }
        }
        Ok(best)
    }

    /// The frontier block with the smallest hash, `None` for an empty tree.
    pub fn canonical_tip(&self) -> Result<Option<Block>, ChainError> {
        Ok(self.canonical_tip_node()?.map(|node| node.block))
    }

    pub fn common_ancestor(&self, a: &TreeNode, b: &TreeNode) -> Result<TreeNode, ChainError> {
        let mut a = a.clone();
        let mut b = b.clone();
        while a.height() > b.height() {
            a = self.require_parent(&a)?;
        }
        while b.height() > a.height() {
            b = self.require_parent(&b)?;
        }
        while a.node_ref() != b.node_ref() {
            a = self.require_parent(&a)?;
            b = self.require_parent(&b)?;
        }
        Ok(a)
    }

    /// Transactions of every block after `ancestor` up to and including
    /// `descendant`, in chronological order.
    pub fn transactions_between(
        &self,
        ancestor: &TreeNode,
        descendant: &TreeNode,
    ) -> Result<Vec<Transaction>, ChainError> {
        let mut blocks = Vec::new();
        let mut current = descendant.clone();
        while current.node_ref() != ancestor.node_ref() {
            if current.height() <= ancestor.height() {
                return Err(ChainError::InvalidChainOrder(format!(
                    "Block {} is not an ancestor of block {}",
                    ancestor.block.hash_str(),
                    descendant.block.hash_str()
                )));
            }
            let parent = self.require_parent(&current)?;
            blocks.push(current.block);
            current = parent;
        }
        blocks.reverse();
        Ok(blocks
            .into_iter()
            .flat_map(|block| block.transactions().to_vec())
            .collect())
    }

    /// The block at `height` on the canonical chain.
    pub fn block_at_height(&self, height: u64) -> Result<Option<Block>, ChainError> {
        let Some(mut node) = self.canonical_tip_node()? else {
            return Ok(None);
        };
        if height > node.height() {
            return Ok(None);
        }
        while node.height() > height {
            node = self.require_parent(&node)?;
        }
        Ok(Some(node.block))
    }

    /// Canonical blocks `from..=to` in ascending height order.
    pub fn canonical_range(&self, from: u64, to: u64) -> Result<Vec<Block>, ChainError> {
        let Some(mut node) = self.canonical_tip_node()? else {
            return Ok(Vec::new());
        };
        let to = to.min(node.height());
        if from > to {
            return Ok(Vec::new());
        }
        while node.height() > to {
            node = self.require_parent(&node)?;
        }
        let mut blocks = vec![node.block.clone()];
        while node.height() > from {
            node = self.require_parent(&node)?;
            blocks.push(node.block.clone());
        }
        blocks.reverse();
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use crate::transaction::TransferTx;

    fn tree() -> (BlockTree, Block) {
        let mut tree = BlockTree::new(Arc::new(InMemoryPersistence::new()));
        let genesis = Block::genesis();
        tree.append_by_height(genesis.clone()).unwrap();
        (tree, genesis)
    }

    fn child(parent: &Block, seed: i64) -> Block {
        let tx = TransferTx::new("alice", "bob", "energy", seed).with_timestamp(seed);
        Block::new(parent.height() + 1, parent.hash(), "alice", 0, vec![tx.into()]).with_timestamp(seed)
    }

    /// Two distinct children of `parent`, ordered (smaller hash, larger hash).
    fn ordered_pair(parent: &Block) -> (Block, Block) {
        let a = child(parent, 11);
        let b = child(parent, 12);
        if a.hash() < b.hash() {
            (a, b)
        } else {
            (b, a)
        }
    }

    #[test]
    fn test_empty_tree_requires_root() {
        let mut tree = BlockTree::new(Arc::new(InMemoryPersistence::new()));
        let genesis = Block::genesis();
        let result = tree.append_by_height(child(&genesis, 1));
        assert!(matches!(result, Err(ChainError::InvalidChainOrder(_))));
        assert!(tree.is_empty());
        assert_eq!(tree.canonical_tip().unwrap(), None);
    }

    #[test]
    fn test_extend_moves_frontier() {
        let (mut tree, genesis) = tree();
        let b1 = child(&genesis, 1);
        let b2 = child(&b1, 2);

        tree.append_by_height(b1).unwrap();
        let node = tree.append_by_height(b2.clone()).unwrap();

        assert_eq!(tree.frontier(), &[node]);
        assert_eq!(tree.canonical_tip().unwrap(), Some(b2));
    }

    #[test]
    fn test_competing_block_creates_tie_and_tip_is_smallest_hash() {
        let (mut tree, genesis) = tree();
        let (low, high) = ordered_pair(&genesis);

        tree.append_by_height(high.clone()).unwrap();
        tree.append_by_height(low.clone()).unwrap();
        assert_eq!(tree.frontier().len(), 2);
        assert_eq!(tree.canonical_tip().unwrap(), Some(low.clone()));

        let (mut other, _) = self::tree();
        other.append_by_height(low.clone()).unwrap();
        other.append_by_height(high).unwrap();
        assert_eq!(other.canonical_tip().unwrap(), Some(low));
    }

    #[test]
    fn test_extension_resolves_tie() {
        let (mut tree, genesis) = tree();
        let (low, high) = ordered_pair(&genesis);
        tree.append_by_height(low).unwrap();
        tree.append_by_height(high.clone()).unwrap();

        let b2 = child(&high, 2);
        tree.append_by_height(b2.clone()).unwrap();
        assert_eq!(tree.frontier().len(), 1);
        assert_eq!(tree.canonical_tip().unwrap(), Some(b2));
    }

    #[test]
    fn test_rejects_gap_and_unknown_parent() {
        let (mut tree, genesis) = tree();
        let b1 = child(&genesis, 1);
        let b2 = child(&b1, 2);

        assert!(matches!(tree.append_by_height(b2), Err(ChainError::InvalidChainOrder(_))));

        tree.append_by_height(b1).unwrap();
        let orphan = Block::new(2, [9u8; 32], "alice", 0, vec![]);
        assert!(matches!(tree.append_by_height(orphan), Err(ChainError::InvalidChainOrder(_))));

        let stale_orphan = Block::new(1, [9u8; 32], "alice", 0, vec![]);
        assert!(matches!(
            tree.append_by_height(stale_orphan),
            Err(ChainError::InvalidChainOrder(_))
        ));
        assert_eq!(tree.frontier().len(), 1);
    }

    #[test]
    fn test_side_branch_below_frontier_does_not_join_frontier() {
        let (mut tree, genesis) = tree();
        let b1 = child(&genesis, 1);
        let b2 = child(&b1, 2);
        tree.append_by_height(b1).unwrap();
        tree.append_by_height(b2.clone()).unwrap();

        let side = child(&genesis, 3);
        tree.append_by_height(side).unwrap();
        assert_eq!(tree.frontier().len(), 1);
        assert_eq!(tree.nodes_at_height(1).unwrap().len(), 2);
        assert_eq!(tree.canonical_tip().unwrap(), Some(b2));
    }

    #[test]
    fn test_duplicate_block_returns_existing_node() {
        let (mut tree, genesis) = tree();
        let b1 = child(&genesis, 1);
        let b2 = child(&b1, 2);
        let first = tree.append_by_height(b1.clone()).unwrap();
        tree.append_by_height(b2).unwrap();

        let again = tree.append_by_height(b1).unwrap();
        assert_eq!(first, again);
        assert_eq!(tree.nodes_at_height(1).unwrap().len(), 1);
    }

    #[test]
    fn test_revert_last_insertion() {
        let store = Arc::new(InMemoryPersistence::new());
        let mut tree = BlockTree::new(store.clone());
        let genesis = Block::genesis();
        tree.append_by_height(genesis.clone()).unwrap();
        let b1 = child(&genesis, 1);
        tree.append_by_height(b1.clone()).unwrap();
        let frontier = tree.frontier().to_vec();
        let nodes_before = store.node_count();

        tree.append_revertable(child(&b1, 2)).unwrap();
        assert_ne!(tree.frontier(), frontier.as_slice());

        tree.revert_last_insertion().unwrap();
        assert_eq!(tree.frontier(), frontier.as_slice());
        assert_eq!(store.node_count(), nodes_before);
        assert!(tree.nodes_at_height(2).unwrap().is_empty());
        let parent = tree.load(frontier[0]).unwrap();
        assert!(parent.children.is_empty());

        tree.revert_last_insertion().unwrap();
        assert_eq!(tree.frontier(), frontier.as_slice());
    }

    #[test]
    fn test_revert_after_rejected_append_keeps_tree() {
        let (mut tree, genesis) = tree();
        let frontier = tree.frontier().to_vec();
        let orphan = Block::new(1, [9u8; 32], "alice", 0, vec![]);
        assert!(tree.append_revertable(orphan).is_err());
        tree.revert_last_insertion().unwrap();
        assert_eq!(tree.frontier(), frontier.as_slice());
        assert_eq!(tree.canonical_tip().unwrap(), Some(genesis));
    }

    #[test]
    fn test_common_ancestor_and_transactions_between() {
        let (mut tree, genesis) = tree();
        let a1 = child(&genesis, 1);
        let a2 = child(&a1, 2);
        let b2 = child(&a1, 20);
        let b3 = child(&b2, 30);

        tree.append_by_height(a1.clone()).unwrap();
        let a2_ref = tree.append_by_height(a2.clone()).unwrap();
        tree.append_by_height(b2.clone()).unwrap();
        let b3_ref = tree.append_by_height(b3.clone()).unwrap();

        let a2_node = tree.load(a2_ref).unwrap();
        let b3_node = tree.load(b3_ref).unwrap();
        let ancestor = tree.common_ancestor(&a2_node, &b3_node).unwrap();
        assert_eq!(ancestor.block, a1);

        let replay = tree.transactions_between(&ancestor, &b3_node).unwrap();
        let expected: Vec<Transaction> = b2
            .transactions()
            .iter()
            .chain(b3.transactions())
            .cloned()
            .collect();
        assert_eq!(replay, expected);

        assert!(tree.transactions_between(&a2_node, &b3_node).is_err());
    }

    #[test]
    fn test_block_at_height_and_range_follow_canonical_chain() {
        let (mut tree, genesis) = tree();
        let b1 = child(&genesis, 1);
        let b2 = child(&b1, 2);
        let side = child(&genesis, 5);
        tree.append_by_height(b1.clone()).unwrap();
        tree.append_by_height(b2.clone()).unwrap();
        tree.append_by_height(side).unwrap();

        assert_eq!(tree.block_at_height(0).unwrap(), Some(genesis.clone()));
        assert_eq!(tree.block_at_height(1).unwrap(), Some(b1.clone()));
        assert_eq!(tree.block_at_height(3).unwrap(), None);

        assert_eq!(tree.canonical_range(1, 10).unwrap(), vec![b1.clone(), b2.clone()]);
        assert_eq!(tree.canonical_range(0, 1).unwrap(), vec![genesis, b1]);
        assert!(tree.canonical_range(3, 5).unwrap().is_empty());
    }

    #[test]
    fn test_restore_from_store() {
        let store = Arc::new(InMemoryPersistence::new());
        let mut tree = BlockTree::new(store.clone());
        let genesis = Block::genesis();
        tree.append_by_height(genesis.clone()).unwrap();
        let (low, high) = ordered_pair(&genesis);
        tree.append_by_height(low.clone()).unwrap();
        tree.append_by_height(high.clone()).unwrap();

        let mut restored = BlockTree::restore(store).unwrap();
        assert_eq!(restored.root(), tree.root());
        assert_eq!(restored.frontier().len(), 2);
        assert_eq!(restored.canonical_tip().unwrap(), Some(low));

        let next = restored.append_by_height(child(&high, 3)).unwrap();
        assert_eq!(next.id, 3);
    }

    #[test]
    fn test_restore_empty_store() {
        let tree = BlockTree::restore(Arc::new(InMemoryPersistence::new())).unwrap();
        assert!(tree.is_empty());
    }
}
