//! Error types for ForkLedger

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("Invalid chain order: {0}")]
    InvalidChainOrder(String),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Transaction already committed: {0}")]
    DoubleCommit(String),
    #[error("Unknown asset: {0}")]
    UnknownAsset(String),
    #[error("Asset already exists: {0}")]
    AssetAlreadyExists(String),
    #[error("Participant already exists: {0}")]
    ParticipantAlreadyExists(String),
    #[error("Node not initialized: {0}")]
    NodeNotInitialized(String),
    /// Unwinding a failed batch could not revert an already applied
    /// transaction. Only a broken state table can produce this.
    #[error("Atomic transaction violated: {0}")]
    AtomicTransaction(String),
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Bincode error: {0}")]
    BincodeError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::BincodeError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::DatabaseError(format!("Serialization failed: {}", err))
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
