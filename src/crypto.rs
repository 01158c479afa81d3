//! Cryptographic primitives for ForkLedger
//!
//! Entities are never signed field by field: blocks and transactions are
//! reduced to a SHA-256 content hash first, and that 32-byte digest is what
//! the secp256k1 key signs.

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest, Sha256};

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

pub type Sha256Hash = [u8; 32];

pub fn hash_to_hex(hash: &Sha256Hash) -> String {
    hex::encode(hash)
}

/// Incremental content hasher with unambiguous field framing.
///
/// Strings and byte slices are length-prefixed so that adjacent fields can
/// never run into each other (`"ab" + "c"` hashes differently from
/// `"a" + "bc"`).
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self { inner: Sha256::new() }
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.update((bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
        self
    }

    pub fn str(&mut self, value: &str) -> &mut Self {
        self.bytes(value.as_bytes())
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.inner.update(value.to_le_bytes());
        self
    }

    pub fn i64(&mut self, value: i64) -> &mut Self {
        self.inner.update(value.to_le_bytes());
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.inner.update(value.to_le_bytes());
        self
    }

    pub fn hash(&mut self, hash: &Sha256Hash) -> &mut Self {
        self.inner.update(hash);
        self
    }

    pub fn finish(self) -> Sha256Hash {
        self.inner.finalize().into()
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;

        Ok(Self::from_secret_key(secret_key))
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| ChainError::CryptoError(format!("Invalid hex secret key: {}", e)))?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Returns the KeyPair's public key as a compressed byte array.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    /// Signs a 32-byte content hash and returns the compact signature bytes.
    pub fn sign_hash(&self, hash: &Sha256Hash) -> [u8; COMPACT_SIGNATURE_SIZE] {
        let message = Message::from_digest(*hash);
        SECP256K1_CONTEXT
            .sign_ecdsa(&message, &self.secret_key)
            .serialize_compact()
    }
}

/// Checks an ECDSA signature over a content hash.
///
/// Malformed keys or signatures are reported the same way as a mismatching
/// signature: the caller only needs to know whether to reject the entity.
pub fn verify_signature(public_key_bytes: &[u8], hash: &Sha256Hash, signature_bytes: &[u8]) -> bool {
    if public_key_bytes.len() != PUBLIC_KEY_SIZE || signature_bytes.len() != COMPACT_SIGNATURE_SIZE {
        return false;
    }

    let public_key = match PublicKey::from_slice(public_key_bytes) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let signature = match Signature::from_compact(signature_bytes) {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    let message = Message::from_digest(*hash);
    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature, &public_key)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(data: &[u8]) -> Sha256Hash {
        let mut hasher = ContentHasher::new();
        hasher.bytes(data);
        hasher.finish()
    }

    #[test]
    fn test_key_generation() {
        let keypair = KeyPair::generate();
        assert_eq!(keypair.public_key_bytes().len(), PUBLIC_KEY_SIZE);
        assert_eq!(keypair.secret_key.as_ref().len(), SECRET_KEY_SIZE);
    }

    #[test]
    fn test_signing_and_verification() {
        let keypair = KeyPair::generate();
        let hash = digest(b"Hello, ForkLedger!");

        let signature = keypair.sign_hash(&hash);
        assert_eq!(signature.len(), COMPACT_SIGNATURE_SIZE);
        assert!(verify_signature(&keypair.public_key_bytes(), &hash, &signature));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signer = KeyPair::generate();
        let other = KeyPair::generate();
        let hash = digest(b"Test message");

        let signature = signer.sign_hash(&hash);
        assert!(!verify_signature(&other.public_key_bytes(), &hash, &signature));
    }

    #[test]
    fn test_tampered_hash_rejected() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign_hash(&digest(b"Original message"));

        assert!(!verify_signature(
            &keypair.public_key_bytes(),
            &digest(b"Tampered message"),
            &signature
        ));
    }

    #[test]
    fn test_malformed_inputs_are_rejected_not_errors() {
        let keypair = KeyPair::generate();
        let hash = digest(b"Test");
        let signature = keypair.sign_hash(&hash);
        let pubkey_bytes = keypair.public_key_bytes();

        assert!(!verify_signature(&pubkey_bytes[1..], &hash, &signature));
        assert!(!verify_signature(&pubkey_bytes, &hash, &signature[1..]));
        assert!(!verify_signature(&[0u8; PUBLIC_KEY_SIZE], &hash, &signature));
    }

    #[test]
    fn test_secret_hex_round_trip() {
        let keypair = KeyPair::generate();
        let restored = KeyPair::from_secret_hex(&keypair.secret_hex()).unwrap();
        assert_eq!(keypair.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn test_from_secret_bytes_invalid_length() {
        let short_bytes = [0u8; SECRET_KEY_SIZE - 1];
        let result = KeyPair::from_secret_bytes(&short_bytes);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Secret key must be"));
    }

    #[test]
    fn test_length_prefix_separates_fields() {
        let mut a = ContentHasher::new();
        a.str("ab").str("c");
        let mut b = ContentHasher::new();
        b.str("a").str("bc");
        assert_ne!(a.finish(), b.finish());
    }
}
