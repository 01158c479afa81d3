//! Pool of unconfirmed transactions
//!
//! Arrival order is kept in a queue; a content-hash index makes the
//! "already present?" check and insertion one step.

use crate::crypto::Sha256Hash;
use crate::transaction::Transaction;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mempool {
    queue: VecDeque<Transaction>,
    index: HashSet<Sha256Hash>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a transaction with the same content hash is queued.
    pub fn add_if_absent(&mut self, tx: Transaction) -> bool {
        if !self.index.insert(tx.hash()) {
            return false;
        }
        self.queue.push_back(tx);
        true
    }

    pub fn remove(&mut self, tx: &Transaction) -> bool {
        self.remove_hash(&tx.hash())
    }

    pub fn remove_hash(&mut self, hash: &Sha256Hash) -> bool {
        if !self.index.remove(hash) {
            return false;
        }
        self.queue.retain(|queued| queued.hash() != *hash);
        true
    }

    pub fn remove_all<'a>(&mut self, txs: impl IntoIterator<Item = &'a Transaction>) {
        let hashes: HashSet<Sha256Hash> = txs.into_iter().map(Transaction::hash).collect();
        if hashes.is_empty() {
            return;
        }
        self.index.retain(|hash| !hashes.contains(hash));
        self.queue.retain(|queued| !hashes.contains(&queued.hash()));
    }

    /// Up to `count` transactions in arrival order; the pool is not modified.
    pub fn peek_up_to(&self, count: usize) -> Vec<Transaction> {
        self.queue.iter().take(count).cloned().collect()
    }

    pub fn contains(&self, tx: &Transaction) -> bool {
        self.index.contains(&tx.hash())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
