//! Derived ledger state kept in step with the canonical chain.
//!
//! - [`asset`] - per-asset balance tables
//! - [`tx`] - fingerprints of committed transactions

pub mod asset;
pub mod tx;

pub use asset::AssetStateTable;
pub use tx::TransactionStateTable;

use crate::error::ChainError;
use crate::transaction::Transaction;

/// A table that can apply and revert single transactions.
///
/// `apply` and `revert` return `false` for a transaction that is not
/// applicable to the current state; the table must be unchanged in that
/// case. A successful `apply` followed by `revert` of the same transaction
/// must restore the previous state exactly.
pub trait StateTable {
    fn apply(&mut self, tx: &Transaction) -> bool;

    fn revert(&mut self, tx: &Transaction) -> bool;

    /// Applies `txs` in order, all or nothing.
    ///
    /// Returns an empty list when every transaction applied. Otherwise the
    /// already applied prefix is reverted in reverse order and the list holds
    /// the single transaction that failed. A revert failing during that
    /// unwind is an [`ChainError::AtomicTransaction`].
    fn apply_batch(&mut self, txs: &[Transaction]) -> Result<Vec<Transaction>, ChainError> {
        let failed_at = match txs.iter().position(|tx| !self.apply(tx)) {
            None => return Ok(Vec::new()),
            Some(index) => index,
        };

        tracing::debug!(
            "Failed trying to apply {} transactions, failed at index {}",
            txs.len(),
            failed_at
        );

        for (index, tx) in txs[..failed_at].iter().enumerate().rev() {
            if !self.revert(tx) {
                return Err(ChainError::AtomicTransaction(format!(
                    "could not revert transaction {} at index {} while unwinding a batch",
                    tx.hash_str(),
                    index
                )));
            }
        }

        Ok(vec![txs[failed_at].clone()])
    }
}
