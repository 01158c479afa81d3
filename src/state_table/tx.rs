use crate::crypto::Sha256Hash;
use std::collections::HashSet;

/// Content hashes of every transaction committed on the canonical chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransactionStateTable {
    committed: HashSet<Sha256Hash>,
}

impl TransactionStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_hashes(hashes: impl IntoIterator<Item = Sha256Hash>) -> Self {
        Self {
            committed: hashes.into_iter().collect(),
        }
    }

    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.committed.contains(hash)
    }

    /// Returns `false` if the hash was already present.
    pub fn add(&mut self, hash: Sha256Hash) -> bool {
        self.committed.insert(hash)
    }

    pub fn remove(&mut self, hash: &Sha256Hash) -> bool {
        self.committed.remove(hash)
    }

    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sha256Hash> {
        self.committed.iter()
    }
}
