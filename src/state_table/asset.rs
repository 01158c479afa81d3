use super::StateTable;
use crate::error::ChainError;
use crate::transaction::{Transaction, UtilityTx};
use std::collections::{BTreeMap, BTreeSet};

/// Balances of one asset, keyed by participant name.
///
/// Created by a utility transaction; transfers then move units between the
/// participants it named. Balances never go negative.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AssetStateTable {
    asset_name: String,
    participants: BTreeSet<String>,
    balances: BTreeMap<String, i64>,
}

impl AssetStateTable {
    pub fn new(asset_name: impl Into<String>, participants: impl IntoIterator<Item = String>) -> Self {
        let participants: BTreeSet<String> = participants.into_iter().collect();
        let balances = participants.iter().map(|p| (p.clone(), 0)).collect();
        Self {
            asset_name: asset_name.into(),
            participants,
            balances,
        }
    }

    pub fn from_utility(tx: &UtilityTx) -> Result<Self, ChainError> {
        tx.validate_shape()?;
        let mut table = Self::new(
            tx.asset_name.clone(),
            tx.participants.iter().map(|p| p.name.clone()),
        );
        for share in &tx.shares {
            table.balances.insert(share.participant.name.clone(), share.share);
        }
        Ok(table)
    }

    pub fn asset_name(&self) -> &str {
        &self.asset_name
    }

    pub fn participants(&self) -> impl Iterator<Item = &str> {
        self.participants.iter().map(String::as_str)
    }

    pub fn balance(&self, participant: &str) -> Option<i64> {
        self.balances.get(participant).copied()
    }

    pub fn balances(&self) -> &BTreeMap<String, i64> {
        &self.balances
    }

    pub fn total_supply(&self) -> i64 {
        self.balances.values().sum()
    }

    /// Moves `amount` from `from` to `to` if `from` can cover it.
    fn transfer(&mut self, from: &str, to: &str, amount: i64) -> bool {
        if amount <= 0 || from == to {
            return false;
        }
        let (Some(from_balance), Some(to_balance)) = (self.balance(from), self.balance(to)) else {
            return false;
        };
        if from_balance < amount {
            return false;
        }
        let Some(to_after) = to_balance.checked_add(amount) else {
            return false;
        };
        self.balances.insert(from.to_string(), from_balance - amount);
        self.balances.insert(to.to_string(), to_after);
        true
    }
}

impl StateTable for AssetStateTable {
    fn apply(&mut self, tx: &Transaction) -> bool {
        match tx {
            Transaction::Transfer(t) if t.asset_name == self.asset_name => {
                self.transfer(&t.sender, &t.receiver, t.amount)
            }
            _ => false,
        }
    }

    fn revert(&mut self, tx: &Transaction) -> bool {
        match tx {
            Transaction::Transfer(t) if t.asset_name == self.asset_name => {
                self.transfer(&t.receiver, &t.sender, t.amount)
            }
            _ => false,
        }
    }
}
