//! Proof-of-work miner for ForkLedger
//!
//! A background thread repeatedly builds a candidate block on the canonical
//! tip, searches for a nonce whose hash meets the difficulty target, appends
//! the result to the local chain and hands it to the broadcaster.

use crate::blockchain::{Block, ChainState};
use crate::config::MinerConfig;
use crate::crypto::KeyPair;
use crate::error::ChainError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Delivers freshly mined blocks to the other participants.
pub trait Broadcast: Send + Sync {
    fn broadcast_block(&self, block: &Block);
}

/// The participant name blocks are mined under, with its signing key.
#[derive(Debug, Clone)]
pub struct MinerIdentity {
    pub name: String,
    pub keypair: KeyPair,
}

impl MinerIdentity {
    pub fn new(name: impl Into<String>, keypair: KeyPair) -> Self {
        Self {
            name: name.into(),
            keypair,
        }
    }
}

pub struct Miner {
    chain: Arc<ChainState>,
    identity: Option<MinerIdentity>,
    config: MinerConfig,
    broadcast: Option<Arc<dyn Broadcast>>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Miner {
    pub fn new(chain: Arc<ChainState>, identity: Option<MinerIdentity>, config: MinerConfig) -> Self {
        Self {
            chain,
            identity,
            config,
            broadcast: None,
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn with_broadcast(mut self, broadcast: Arc<dyn Broadcast>) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    /// Starts the mining thread. Calling it while the thread runs does nothing.
    pub fn start(self: &Arc<Self>) -> Result<(), ChainError> {
        let mut handle = self.handle.lock();
        if let Some(running) = handle.as_ref() {
            if !running.is_finished() && !self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
        if let Some(previous) = handle.take() {
            if previous.join().is_err() {
                tracing::error!("Previous mining thread panicked");
            }
        }

        self.stop.store(false, Ordering::SeqCst);
        let miner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("miner".to_string())
            .spawn(move || miner.run())?;
        *handle = Some(spawned);
        tracing::info!("Miner started");
        Ok(())
    }

    /// Asks the mining thread to stop; an attempt in progress is abandoned
    /// at its next cancellation check.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            tracing::info!("Miner stopping");
        }
    }

    /// Stops the thread and waits for it to exit.
    pub fn shutdown(&self) {
        self.stop();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Mining thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::SeqCst)
            && self
                .handle
                .lock()
                .as_ref()
                .map(|handle| !handle.is_finished())
                .unwrap_or(false)
    }

    fn run(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            thread::sleep(self.config.sleep);
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            match self.mine_block() {
                Ok(Some(block)) => {
                    self.submit_mined_block(block);
                }
                Ok(None) => {}
                Err(e) => tracing::error!("Mining attempt failed: {}", e),
            }
        }
        tracing::info!("Miner stopped");
    }

    /// Appends a mined block if it still extends the canonical tip, and
    /// broadcasts it only when the append succeeded.
    pub fn submit_mined_block(&self, block: Block) -> bool {
        let hash = block.hash_str();
        if !self.chain.append_if_extends_tip(block.clone()) {
            tracing::info!("Mined block {} at height {} was not accepted", hash, block.height());
            return false;
        }
        if let Some(broadcast) = &self.broadcast {
            broadcast.broadcast_block(&block);
        }
        true
    }

    /// One mining attempt on the current tip.
    ///
    /// `Ok(None)` means nothing was produced: no candidates while empty blocks
    /// are disabled, the trial budget ran out, or the miner was stopped.
    pub fn mine_block(&self) -> Result<Option<Block>, ChainError> {
        let identity = match &self.identity {
            Some(identity) if !identity.name.is_empty() => identity,
            _ => {
                return Err(ChainError::NodeNotInitialized(
                    "Miner has no name or signing key".to_string(),
                ))
            }
        };

        let previous = self
            .chain
            .canonical_tip()
            .ok_or_else(|| ChainError::NodeNotInitialized("Chain has no tip".to_string()))?;

        let transactions = self
            .chain
            .select_mining_candidates(self.config.transactions_per_block)?;
        if transactions.is_empty() && !self.config.mine_empty_blocks {
            return Ok(None);
        }

        let mut block = Block::new(
            previous.height() + 1,
            previous.hash(),
            identity.name.clone(),
            self.config.difficulty,
            transactions,
        );
        if block.timestamp() <= previous.timestamp() {
            block = block.with_timestamp(previous.timestamp() + 1);
        }
        block.set_nonce(rand::random::<u64>());

        let check_interval = self.config.cancel_check_interval.max(1);
        let mut trials: u64 = 0;
        while !block.meets_target() {
            trials += 1;
            if trials >= self.config.trials_per_block {
                tracing::debug!(
                    "No nonce found for height {} after {} trials",
                    block.height(),
                    trials
                );
                return Ok(None);
            }
            if trials % check_interval == 0 && self.stop.load(Ordering::SeqCst) {
                return Ok(None);
            }
            block.increment_nonce();
        }

        block.sign(&identity.keypair);
        tracing::info!(
            "Mined block {} at height {} with {} transactions after {} trials",
            block.hash_str(),
            block.height(),
            block.transactions().len(),
            trials + 1
        );
        Ok(Some(block))
    }
}
