//! ForkLedger - A peer-to-peer asset ledger with a fork-aware block tree
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`blockchain`] - Blocks, the fork-aware block tree, chain state and validation
//! - [`transaction`] - Transfer and utility transactions
//! - [`mempool`] - Pool of unconfirmed transactions
//! - [`state_table`] - Asset balances and committed transaction fingerprints
//!
//! ## Consensus
//! - [`miner`] - Proof-of-work mining
//!
//! ## Cryptography
//! - [`crypto`] - Hashing and signatures (sha2, secp256k1)
//! - [`participant`] - Known participants and their keys
//!
//! ## State Management
//! - [`persistence`] - Database layer (SQLite)
//!
//! ## Networking
//! - [`codec`] - Wire messages
//! - [`network`] - TCP transport
//! - [`sync`] - Chain synchronization
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`node`] - Process wiring
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod mempool;
pub mod state_table;
pub mod transaction;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod miner;

// ============================================================================
// Cryptography & Security
// ============================================================================
pub mod crypto;
pub mod participant;

// ============================================================================
// State Management
// ============================================================================
pub mod persistence;

// ============================================================================
// Networking
// ============================================================================
pub mod codec;
pub mod network;
pub mod sync;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
pub mod node;
