use crate::crypto::{verify_signature, ContentHasher, KeyPair, Sha256Hash};
use crate::transaction::Transaction;
use once_cell::sync::OnceCell;

pub const GENESIS_TIMESTAMP: i64 = 1_539_259_694;
pub const GENESIS_NONCE: u64 = 2_001_681_207;
pub const GENESIS_MINER: &str = "Genesis Block";
pub const GENESIS_TAG: &str = "ForkLedger genesis";

/// Highest difficulty for which the target `2^(254 - difficulty)` is >= 1.
pub const MAX_DIFFICULTY: u32 = 254;

/// Nonces stay within 63 bits so they survive signed 64-bit storage.
const NONCE_MASK: u64 = i64::MAX as u64;

/// A block of the ledger.
///
/// Everything except the nonce and the signature is folded into a content
/// hash that is computed once and cached. The final block hash combines that
/// cached value with the nonce, so the nonce search never re-hashes the
/// transaction list, and the signature is made over the final hash.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Block {
    height: u64,
    /// Milliseconds since the Unix epoch.
    timestamp: i64,
    nonce: u64,
    miner: String,
    difficulty: u32,
    previous_hash: Sha256Hash,
    signature: Option<Vec<u8>>,
    tag: String,
    transactions: Vec<Transaction>,
    #[serde(skip)]
    content_hash: OnceCell<Sha256Hash>,
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.height == other.height
            && self.timestamp == other.timestamp
            && self.nonce == other.nonce
            && self.miner == other.miner
            && self.difficulty == other.difficulty
            && self.previous_hash == other.previous_hash
            && self.signature == other.signature
            && self.tag == other.tag
            && self.transactions == other.transactions
    }
}

impl Eq for Block {}

impl Block {
    pub fn new(
        height: u64,
        previous_hash: Sha256Hash,
        miner: impl Into<String>,
        difficulty: u32,
        transactions: Vec<Transaction>,
    ) -> Self {
        Block {
            height,
            timestamp: chrono::Utc::now().timestamp_millis(),
            nonce: 0,
            miner: miner.into(),
            difficulty,
            previous_hash,
            signature: None,
            tag: String::new(),
            transactions,
            content_hash: OnceCell::new(),
        }
    }

    /// The hard-coded root every node starts from.
    pub fn genesis() -> Self {
        Block::new(0, [0u8; 32], GENESIS_MINER, 0, Vec::new())
            .with_timestamp(GENESIS_TIMESTAMP)
            .with_nonce(GENESIS_NONCE)
            .with_tag(GENESIS_TAG)
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self.content_hash = OnceCell::new();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self.content_hash = OnceCell::new();
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.set_nonce(nonce);
        self
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn miner(&self) -> &str {
        &self.miner
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn previous_hash(&self) -> &Sha256Hash {
        &self.previous_hash
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }

    /// Only the nonce may change before signing; the cached content hash
    /// stays valid because it never covered the nonce.
    pub fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce & NONCE_MASK;
    }

    pub fn set_signature(&mut self, signature: Vec<u8>) {
        self.signature = Some(signature);
    }

    /// Hash over every field except nonce and signature, computed once.
    pub fn content_hash(&self) -> Sha256Hash {
        *self.content_hash.get_or_init(|| {
            let mut hasher = ContentHasher::new();
            hasher
                .i64(self.timestamp)
                .u64(self.height)
                .str(&self.miner)
                .u32(self.difficulty)
                .hash(&self.previous_hash)
                .str(&self.tag)
                .u64(self.transactions.len() as u64);
            for tx in &self.transactions {
                hasher.hash(&tx.hash());
            }
            hasher.finish()
        })
    }

    /// The final block hash: the cached content hash combined with the nonce.
    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = ContentHasher::new();
        hasher.hash(&self.content_hash()).u64(self.nonce);
        hasher.finish()
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.hash())
    }

    /// Advances the nonce by one, wrapping inside the 63-bit range.
    pub fn increment_nonce(&mut self) {
        self.set_nonce(self.nonce.wrapping_add(1));
    }

    pub fn sign(&mut self, keypair: &KeyPair) {
        let signature = keypair.sign_hash(&self.hash());
        self.signature = Some(signature.to_vec());
    }

    pub fn verify_signature(&self, public_key: &[u8]) -> bool {
        match &self.signature {
            Some(signature) => verify_signature(public_key, &self.hash(), signature),
            None => false,
        }
    }

    /// `2^(254 - difficulty)` as a big-endian 256-bit integer.
    pub fn difficulty_target(difficulty: u32) -> [u8; 32] {
        let mut target = [0u8; 32];
        if difficulty > MAX_DIFFICULTY {
            return target;
        }
        let bit = (MAX_DIFFICULTY - difficulty) as usize;
        target[31 - bit / 8] = 1u8 << (bit % 8);
        target
    }

    /// Big-endian byte arrays order exactly like the unsigned integers they
    /// encode, so the comparison is a plain array comparison.
    pub fn hash_meets_target(hash: &Sha256Hash, difficulty: u32) -> bool {
        *hash <= Block::difficulty_target(difficulty)
    }

    pub fn meets_target(&self) -> bool {
        Block::hash_meets_target(&self.hash(), self.difficulty)
    }
}
