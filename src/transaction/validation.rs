/// Stateless validation of transactions, separated from type definitions
use crate::crypto::verify_signature;
use crate::error::ChainError;
use crate::participant::ParticipantRegistry;
use crate::transaction::types::{Transaction, TransferTx, UtilityTx};
use std::collections::HashSet;

impl Transaction {
    /// Checks the signature against the sender's registered key.
    ///
    /// An unknown sender, a missing signature and a bad signature all
    /// yield `false`.
    pub fn verify_signature(&self, registry: &ParticipantRegistry) -> bool {
        let signer = match registry.by_name(self.sender()) {
            Some(p) => p,
            None => return false,
        };
        match self.signature() {
            Some(signature) => verify_signature(&signer.public_key, &self.hash(), signature),
            None => false,
        }
    }

    /// Structural checks that need no chain state.
    pub fn validate_shape(&self) -> Result<(), ChainError> {
        match self {
            Transaction::Transfer(tx) => tx.validate_shape(),
            Transaction::Utility(tx) => tx.validate_shape(),
        }
    }
}

impl TransferTx {
    pub fn validate_shape(&self) -> Result<(), ChainError> {
        if self.asset_name.is_empty() {
            return Err(ChainError::InvalidTransaction("Asset name must not be empty".to_string()));
        }
        if self.amount <= 0 {
            return Err(ChainError::InvalidTransaction(format!(
                "Transfer amount must be positive, got {}",
                self.amount
            )));
        }
        if self.sender == self.receiver {
            return Err(ChainError::InvalidTransaction(format!(
                "Sender and receiver are both {}",
                self.sender
            )));
        }
        Ok(())
    }
}

impl UtilityTx {
    pub fn validate_shape(&self) -> Result<(), ChainError> {
        if self.asset_name.is_empty() {
            return Err(ChainError::InvalidTransaction("Asset name must not be empty".to_string()));
        }

        let mut names = HashSet::new();
        for participant in &self.participants {
            if !names.insert(participant.name.as_str()) {
                return Err(ChainError::InvalidTransaction(format!(
                    "Participant {} listed twice for asset {}",
                    participant.name, self.asset_name
                )));
            }
        }

        let mut seen_shares = HashSet::new();
        for share in &self.shares {
            if share.share < 0 {
                return Err(ChainError::InvalidTransaction(format!(
                    "Negative share {} for {}",
                    share.share, share.participant.name
                )));
            }
            if !names.contains(share.participant.name.as_str()) {
                return Err(ChainError::InvalidTransaction(format!(
                    "Share holder {} is not a participant of asset {}",
                    share.participant.name, self.asset_name
                )));
            }
            if !seen_shares.insert(share.participant.name.as_str()) {
                return Err(ChainError::InvalidTransaction(format!(
                    "Duplicate share for {}",
                    share.participant.name
                )));
            }
        }
        Ok(())
    }
}
