/// Transaction types for ForkLedger
use crate::crypto::{ContentHasher, KeyPair, Sha256Hash};
use crate::participant::Participant;

/// A transaction that can occur in a block
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Transaction {
    /// Moves an amount of an existing asset between two participants.
    Transfer(TransferTx),
    /// Establishes a new asset and its initial share table.
    Utility(UtilityTx),
}

impl Transaction {
    pub fn hash(&self) -> Sha256Hash {
        match self {
            Transaction::Transfer(tx) => tx.hash(),
            Transaction::Utility(tx) => tx.hash(),
        }
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.hash())
    }

    pub fn is_utility(&self) -> bool {
        matches!(self, Transaction::Utility(_))
    }

    pub fn sender(&self) -> &str {
        match self {
            Transaction::Transfer(tx) => &tx.sender,
            Transaction::Utility(tx) => &tx.sender,
        }
    }

    pub fn receiver(&self) -> &str {
        match self {
            Transaction::Transfer(tx) => &tx.receiver,
            Transaction::Utility(tx) => &tx.receiver,
        }
    }

    pub fn asset_name(&self) -> &str {
        match self {
            Transaction::Transfer(tx) => &tx.asset_name,
            Transaction::Utility(tx) => &tx.asset_name,
        }
    }

    pub fn amount(&self) -> i64 {
        match self {
            Transaction::Transfer(tx) => tx.amount,
            Transaction::Utility(tx) => tx.amount,
        }
    }

    pub fn is_external(&self) -> bool {
        match self {
            Transaction::Transfer(tx) => tx.external,
            Transaction::Utility(tx) => tx.external,
        }
    }

    pub fn set_external(&mut self, external: bool) {
        match self {
            Transaction::Transfer(tx) => tx.external = external,
            Transaction::Utility(tx) => tx.external = external,
        }
    }

    pub fn signature(&self) -> Option<&[u8]> {
        match self {
            Transaction::Transfer(tx) => tx.signature.as_deref(),
            Transaction::Utility(tx) => tx.signature.as_deref(),
        }
    }

    /// Signs the content hash with the sender's key.
    pub fn sign(&mut self, keypair: &KeyPair) {
        let signature = keypair.sign_hash(&self.hash()).to_vec();
        match self {
            Transaction::Transfer(tx) => tx.signature = Some(signature),
            Transaction::Utility(tx) => tx.signature = Some(signature),
        }
    }
}

impl From<TransferTx> for Transaction {
    fn from(tx: TransferTx) -> Self {
        Transaction::Transfer(tx)
    }
}

impl From<UtilityTx> for Transaction {
    fn from(tx: UtilityTx) -> Self {
        Transaction::Utility(tx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransferTx {
    pub sender: String,
    pub receiver: String,
    pub asset_name: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub amount: i64,
    pub signature: Option<Vec<u8>>,
    pub tag: String,
    /// Submitted by a client outside the participant network.
    pub external: bool,
}

impl TransferTx {
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        asset_name: impl Into<String>,
        amount: i64,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            asset_name: asset_name.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            amount,
            signature: None,
            tag: String::new(),
            external: false,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    fn hash_common(&self, hasher: &mut ContentHasher) {
        hasher
            .str(&self.sender)
            .str(&self.receiver)
            .str(&self.asset_name)
            .i64(self.timestamp)
            .i64(self.amount)
            .str(&self.tag);
    }

    /// Covers sender, receiver, asset, timestamp, amount and tag. The
    /// signature and the external flag are not part of the content.
    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = ContentHasher::new();
        hasher.str("transfer");
        self.hash_common(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ParticipantShare {
    pub participant: Participant,
    pub share: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UtilityTx {
    pub sender: String,
    pub receiver: String,
    pub asset_name: String,
    pub timestamp: i64,
    pub amount: i64,
    pub signature: Option<Vec<u8>>,
    pub tag: String,
    pub external: bool,
    /// Participants allowed to hold the asset.
    pub participants: Vec<Participant>,
    /// Initial holdings, in declaration order.
    pub shares: Vec<ParticipantShare>,
}

impl UtilityTx {
    pub fn new(
        sender: impl Into<String>,
        asset_name: impl Into<String>,
        participants: Vec<Participant>,
        shares: Vec<ParticipantShare>,
    ) -> Self {
        let sender = sender.into();
        Self {
            receiver: sender.clone(),
            sender,
            asset_name: asset_name.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            amount: 0,
            signature: None,
            tag: String::new(),
            external: false,
            participants,
            shares,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = ContentHasher::new();
        hasher
            .str("utility")
            .str(&self.sender)
            .str(&self.receiver)
            .str(&self.asset_name)
            .i64(self.timestamp)
            .i64(self.amount)
            .str(&self.tag)
            .str(&self.asset_name);

        hasher.u64(self.participants.len() as u64);
        for participant in &self.participants {
            participant.hash_identity(&mut hasher);
        }

        hasher.u64(self.shares.len() as u64);
        for share in &self.shares {
            share.participant.hash_identity(&mut hasher);
            hasher.i64(share.share);
        }
        hasher.finish()
    }
}
