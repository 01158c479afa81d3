use super::chain::Block;
use crate::error::ChainError;
use crate::participant::ParticipantRegistry;
use std::collections::HashSet;

pub fn validate_no_duplicate_transactions(block: &Block) -> Result<(), ChainError> {
    let mut seen = HashSet::new();
    for tx in block.transactions() {
        if !seen.insert(tx.hash()) {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction {} appears twice in block {}",
                tx.hash_str(),
                block.hash_str()
            )));
        }
    }
    Ok(())
}

/// A block carries either only utility transactions or none at all.
pub fn validate_transaction_mix(block: &Block) -> Result<(), ChainError> {
    let utility = block.transactions().iter().filter(|tx| tx.is_utility()).count();
    if utility != 0 && utility != block.transactions().len() {
        return Err(ChainError::InvalidBlock(format!(
            "Block {} mixes {} utility transaction(s) with transfers",
            block.hash_str(),
            utility
        )));
    }
    Ok(())
}

/// Checks a block received from a peer before it reaches the chain state.
///
/// The genesis block is accepted only in its fixed form. Every other block
/// must be signed by a registered miner, meet its proof-of-work target at no
/// less than `min_difficulty`, and carry well-formed transactions signed by
/// registered senders.
pub fn validate_block(
    block: &Block,
    registry: &ParticipantRegistry,
    min_difficulty: u32,
) -> Result<(), ChainError> {
    if block.is_genesis() {
        if block.hash() != Block::genesis().hash() {
            return Err(ChainError::InvalidBlock(format!(
                "Block {} claims height 0 but is not the genesis block",
                block.hash_str()
            )));
        }
        return Ok(());
    }

    let miner = registry.by_name(block.miner()).ok_or_else(|| {
        ChainError::InvalidBlock(format!("Unknown miner {}", block.miner()))
    })?;
    if !block.verify_signature(&miner.public_key) {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid miner signature on block {}",
            block.hash_str()
        )));
    }

    if block.difficulty() < min_difficulty {
        return Err(ChainError::InvalidBlock(format!(
            "Block difficulty {} is below the required {}",
            block.difficulty(),
            min_difficulty
        )));
    }
    if !block.meets_target() {
        return Err(ChainError::InvalidBlock(format!(
            "Block {} does not meet its difficulty target {}",
            block.hash_str(),
            block.difficulty()
        )));
    }

    for tx in block.transactions() {
        tx.validate_shape()?;
        if !tx.verify_signature(registry) {
            return Err(ChainError::InvalidTransaction(format!(
                "Invalid signature on transaction {} from {}",
                tx.hash_str(),
                tx.sender()
            )));
        }
    }

    validate_transaction_mix(block)?;
    validate_no_duplicate_transactions(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::participant::Participant;
    use crate::transaction::{Transaction, TransferTx, UtilityTx};

    struct Fixture {
        keypair: KeyPair,
        registry: ParticipantRegistry,
    }

    fn fixture() -> Fixture {
        let keypair = KeyPair::generate();
        let mut registry = ParticipantRegistry::new();
        registry
            .register(Participant::new("alice", keypair.public_key_bytes().to_vec(), "127.0.0.1", 9000))
            .unwrap();
        Fixture { keypair, registry }
    }

    fn signed_tx(keypair: &KeyPair, amount: i64) -> Transaction {
        let mut tx = Transaction::from(TransferTx::new("alice", "bob", "energy", amount).with_timestamp(amount));
        tx.sign(keypair);
        tx
    }

    /// Searches a nonce for difficulty 1, which takes a couple of trials.
    fn mined(keypair: &KeyPair, txs: Vec<Transaction>) -> Block {
        let mut block = Block::new(1, Block::genesis().hash(), "alice", 1, txs).with_timestamp(5);
        while !block.meets_target() {
            block.increment_nonce();
        }
        block.sign(keypair);
        block
    }

    #[test]
    fn test_valid_block_passes() {
        let f = fixture();
        let block = mined(&f.keypair, vec![signed_tx(&f.keypair, 1), signed_tx(&f.keypair, 2)]);
        assert!(validate_block(&block, &f.registry, 1).is_ok());
    }

    #[test]
    fn test_genesis_only_in_fixed_form() {
        let f = fixture();
        assert!(validate_block(&Block::genesis(), &f.registry, 20).is_ok());
        let fake = Block::genesis().with_tag("not genesis");
        assert!(validate_block(&fake, &f.registry, 0).is_err());
    }

    #[test]
    fn test_rejects_unknown_miner_and_bad_signature() {
        let f = fixture();
        let mut block = mined(&f.keypair, vec![]);
        block.sign(&KeyPair::generate());
        assert!(matches!(validate_block(&block, &f.registry, 0), Err(ChainError::InvalidBlock(_))));

        let stranger = Block::new(1, [0u8; 32], "mallory", 0, vec![]);
        assert!(matches!(validate_block(&stranger, &f.registry, 0), Err(ChainError::InvalidBlock(_))));
    }

    #[test]
    fn test_rejects_low_difficulty() {
        let f = fixture();
        let block = mined(&f.keypair, vec![]);
        assert!(validate_block(&block, &f.registry, 2).is_err());
    }

    #[test]
    fn test_rejects_unsigned_transaction() {
        let f = fixture();
        let unsigned = Transaction::from(TransferTx::new("alice", "bob", "energy", 3));
        let block = mined(&f.keypair, vec![unsigned]);
        assert!(matches!(
            validate_block(&block, &f.registry, 0),
            Err(ChainError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_rejects_duplicates_and_mixed_blocks() {
        let f = fixture();
        let tx = signed_tx(&f.keypair, 4);
        let duplicated = mined(&f.keypair, vec![tx.clone(), tx.clone()]);
        assert!(validate_no_duplicate_transactions(&duplicated).is_err());
        assert!(validate_block(&duplicated, &f.registry, 0).is_err());

        let mut utility = Transaction::from(UtilityTx::new("alice", "energy", vec![], vec![]).with_timestamp(1));
        utility.sign(&f.keypair);
        let mixed = mined(&f.keypair, vec![utility.clone(), tx]);
        assert!(matches!(validate_transaction_mix(&mixed), Err(ChainError::InvalidBlock(_))));
        assert!(validate_transaction_mix(&mined(&f.keypair, vec![utility])).is_ok());
    }
}
