//! Wire messages exchanged between ForkLedger nodes
//!
//! Every frame carries one bincode-encoded [`WireMessage`]. Blocks and
//! transactions coming off the wire are only handed out after their
//! signatures have been checked against the participant registry.

use crate::blockchain::{validate_block, Block, ChainStatus};
use crate::crypto::Sha256Hash;
use crate::error::ChainError;
use crate::participant::ParticipantRegistry;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    Block(Block),
    Transaction(Transaction),
    /// Canonical blocks `from..=to` of the receiver; `to: None` means its tip.
    SyncRequest {
        from: u64,
        to: Option<u64>,
        from_hash: Option<Sha256Hash>,
        sending_node: String,
    },
    SyncResponse(Vec<Block>),
    StatusRequest,
    StatusResponse(ChainStatus),
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ChainError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChainError> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Block(_) => "block",
            WireMessage::Transaction(_) => "transaction",
            WireMessage::SyncRequest { .. } => "sync request",
            WireMessage::SyncResponse(_) => "sync response",
            WireMessage::StatusRequest => "status request",
            WireMessage::StatusResponse(_) => "status response",
        }
    }
}

/// Encodes outgoing entities and verifies incoming ones.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    registry: Arc<ParticipantRegistry>,
    min_difficulty: u32,
}

impl MessageCodec {
    pub fn new(registry: Arc<ParticipantRegistry>, min_difficulty: u32) -> Self {
        Self {
            registry,
            min_difficulty,
        }
    }

    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn encode_block(&self, block: &Block) -> Result<Vec<u8>, ChainError> {
        WireMessage::Block(block.clone()).encode()
    }

    pub fn encode_transaction(&self, tx: &Transaction) -> Result<Vec<u8>, ChainError> {
        WireMessage::Transaction(tx.clone()).encode()
    }

    /// A block frame whose block passes [`validate_block`]; anything else is
    /// reported as `None`.
    pub fn decode_block(&self, bytes: &[u8]) -> Option<Block> {
        match WireMessage::decode(bytes) {
            Ok(WireMessage::Block(block)) => self.verify_block(block),
            Ok(other) => {
                tracing::warn!("Expected a block, got a {}", other.kind());
                None
            }
            Err(e) => {
                tracing::warn!("Undecodable block frame: {}", e);
                None
            }
        }
    }

    /// A transaction frame signed by its registered sender; anything else is
    /// reported as `None`.
    pub fn decode_transaction(&self, bytes: &[u8]) -> Option<Transaction> {
        match WireMessage::decode(bytes) {
            Ok(WireMessage::Transaction(tx)) => self.verify_transaction(tx),
            Ok(other) => {
                tracing::warn!("Expected a transaction, got a {}", other.kind());
                None
            }
            Err(e) => {
                tracing::warn!("Undecodable transaction frame: {}", e);
                None
            }
        }
    }

    pub fn verify_block(&self, block: Block) -> Option<Block> {
        match validate_block(&block, &self.registry, self.min_difficulty) {
            Ok(()) => Some(block),
            Err(e) => {
                tracing::warn!("Rejected block {} from {}: {}", block.hash_str(), block.miner(), e);
                None
            }
        }
    }

    pub fn verify_transaction(&self, tx: Transaction) -> Option<Transaction> {
        if let Err(e) = tx.validate_shape() {
            tracing::warn!("Rejected transaction {}: {}", tx.hash_str(), e);
            return None;
        }
        if !tx.verify_signature(&self.registry) {
            tracing::warn!("Rejected transaction {}: bad signature for {}", tx.hash_str(), tx.sender());
            return None;
        }
        Some(tx)
    }

    /// Every block of a sync reply must verify, otherwise the reply is dropped.
    pub fn verify_blocks(&self, blocks: Vec<Block>) -> Option<Vec<Block>> {
        blocks.into_iter().map(|block| self.verify_block(block)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::participant::Participant;
    use crate::transaction::TransferTx;

    fn setup() -> (MessageCodec, KeyPair) {
        let keypair = KeyPair::generate();
        let mut registry = ParticipantRegistry::new();
        registry
            .register(Participant::new("alice", keypair.public_key_bytes().to_vec(), "127.0.0.1", 9000))
            .unwrap();
        (MessageCodec::new(Arc::new(registry), 1), keypair)
    }

    fn mined_block(keypair: &KeyPair) -> Block {
        let genesis = Block::genesis();
        let mut block = Block::new(1, genesis.hash(), "alice", 1, Vec::new()).with_timestamp(5);
        while !block.meets_target() {
            block.increment_nonce();
        }
        block.sign(keypair);
        block
    }

    #[test]
    fn test_block_passes_through_codec() {
        let (codec, keypair) = setup();
        let block = mined_block(&keypair);
        let bytes = codec.encode_block(&block).unwrap();
        let decoded = codec.decode_block(&bytes).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn test_forged_block_signature_is_rejected() {
        let (codec, _) = setup();
        let block = mined_block(&KeyPair::generate());
        let bytes = codec.encode_block(&block).unwrap();
        assert!(codec.decode_block(&bytes).is_none());
    }

    #[test]
    fn test_block_below_min_difficulty_is_rejected() {
        let (codec, keypair) = setup();
        let mut block = Block::new(1, Block::genesis().hash(), "alice", 0, Vec::new());
        block.sign(&keypair);
        assert!(codec.verify_block(block).is_none());
    }

    #[test]
    fn test_transaction_signature_is_checked() {
        let (codec, keypair) = setup();
        let mut tx: Transaction = TransferTx::new("alice", "bob", "energy", 5).into();
        tx.sign(&keypair);
        let bytes = codec.encode_transaction(&tx).unwrap();
        assert_eq!(codec.decode_transaction(&bytes), Some(tx.clone()));

        let mut forged = tx;
        forged.sign(&KeyPair::generate());
        let bytes = codec.encode_transaction(&forged).unwrap();
        assert!(codec.decode_transaction(&bytes).is_none());
    }

    #[test]
    fn test_wrong_kind_and_garbage_are_rejected() {
        let (codec, keypair) = setup();
        let block_bytes = codec.encode_block(&mined_block(&keypair)).unwrap();
        assert!(codec.decode_transaction(&block_bytes).is_none());
        assert!(codec.decode_block(&[0xff, 0x01, 0x02]).is_none());
    }

    #[test]
    fn test_sync_reply_with_one_bad_block_is_dropped() {
        let (codec, keypair) = setup();
        let good = mined_block(&keypair);
        let bad = mined_block(&KeyPair::generate());
        assert_eq!(codec.verify_blocks(vec![good.clone()]), Some(vec![good.clone()]));
        assert!(codec.verify_blocks(vec![good, bad]).is_none());
    }
}
