//! Chain synchronization for ForkLedger
//!
//! When a peer announces a block that cannot be linked to the local tree,
//! the node walks backwards from its own tip in fixed-size jumps and asks the
//! peer for its canonical blocks starting at each jump point. The first
//! non-empty answer starts at a block both sides share and is appended in
//! height order.

use crate::blockchain::Block;
use crate::crypto::Sha256Hash;
use crate::participant::Participant;

/// Something that can hand out canonical block ranges of a peer.
///
/// `None` means the peer could not be asked (I/O failure, timeout, garbled
/// reply). `Some(vec![])` means the peer answered but the block it holds at
/// `from` does not match `from_hash`.
pub trait BlockSource: Send + Sync {
    fn request_blocks(
        &self,
        peer: &Participant,
        from: u64,
        to: Option<u64>,
        from_hash: Sha256Hash,
    ) -> Option<Vec<Block>>;
}

/// Sequence of request start heights, `offset` apart, ending at 0.
#[derive(Debug, Clone)]
pub struct SyncCursor {
    next: Option<u64>,
    offset: u64,
}

impl SyncCursor {
    pub fn new(tip_height: u64, offset: u64) -> Self {
        Self {
            next: Some(tip_height.saturating_sub(offset.max(1))),
            offset: offset.max(1),
        }
    }
}

impl Iterator for SyncCursor {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let current = self.next?;
        self.next = if current == 0 {
            None
        } else {
            Some(current.saturating_sub(self.offset))
        };
        Some(current)
    }
}

/// How a sync attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Blocks were fetched and all of them appended.
    Synced { appended: usize },
    /// The peer is not a registered participant.
    UnknownPeer,
    /// The peer did not answer.
    PeerUnavailable,
    /// Even the genesis block did not match the peer's chain.
    NoCommonBlock,
    /// A fetched block was rejected by the chain state.
    Rejected { height: u64 },
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Synced { .. })
    }
}
