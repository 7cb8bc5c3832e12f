//! Collaborator traits consumed by the block-production engine.
//!
//! The miner never reaches into chain state, the network, or the wallet
//! directly; everything arrives through these object-safe traits so the
//! engine can be driven by a full node in production and by mocks in tests.

use crate::types::{Block, BlockHeader, Hash256};

/// An atomic snapshot of the active chain tip.
///
/// Taken in a single [`ChainView::tip`] call so height, hash, and
/// median-time-past can never be observed torn across a reorg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipInfo {
    /// Hash of the tip block header.
    pub hash: Hash256,
    /// Height of the tip block.
    pub height: u64,
    /// Median of the previous 11 block timestamps.
    pub median_time_past: u64,
}

/// Read-only view of chain state and the consensus rules the assembler has
/// to pre-empt.
///
/// Implementations synchronize internally; a [`tip`](Self::tip) snapshot
/// plus per-call locking stands in for holding the chain-state lock.
pub trait ChainView: Send + Sync {
    /// Snapshot of the current active tip.
    fn tip(&self) -> TipInfo;

    /// Whether the witness soft fork is active as of the given tip.
    fn is_witness_enabled(&self, tip: &TipInfo) -> bool;

    /// Compact difficulty bits required for a block extending `tip` with the
    /// given header (the header's time matters on min-difficulty networks).
    fn next_work_required(&self, tip: &TipInfo, header: &BlockHeader) -> u32;

    /// Block subsidy at the given height, in embers.
    fn block_subsidy(&self, height: u64) -> u64;

    /// Block version from chain parameters and soft-fork signalling.
    fn compute_block_version(&self, tip: &TipInfo) -> i32;

    /// Witness commitment for the assembled block. Opaque to the miner.
    fn coinbase_commitment(&self, block: &Block) -> Vec<u8>;

    /// Full validity check of an assembled block against the given tip.
    ///
    /// A failure here means the assembler produced an invalid template,
    /// which is a bug, not a recoverable condition.
    fn test_block_validity(&self, block: &Block, tip: &TipInfo) -> Result<(), String>;
}

/// Connection-manager facts the miner gates on.
pub trait NetworkInfo: Send + Sync {
    /// Number of connected peers.
    fn peer_count(&self) -> usize;

    /// Whether the node is still in initial block download.
    fn is_initial_block_download(&self) -> bool;
}

/// Wallet contract for obtaining and committing the coinbase payout script.
pub trait MiningWallet: Send + Sync {
    /// Reserve a script to pay the coinbase to. `None` when the keypool is
    /// exhausted.
    fn script_for_mining(&self) -> Option<Vec<u8>>;

    /// Consume the reservation after a block paying the script was accepted.
    fn keep_script(&self);
}

/// Destination for solved blocks: the same pipeline that handles blocks
/// received from peers.
pub trait BlockSink: Send + Sync {
    /// Validate, connect, and relay a new block. Returns whether the block
    /// was accepted.
    fn process_new_block(&self, block: &Block, force_processing: bool) -> bool;
}

/// Time source. The miner uses network-adjusted time, never the raw wall
/// clock, so that header times agree with peers.
pub trait Clock: Send + Sync {
    /// Current adjusted time, unix seconds.
    fn adjusted_time(&self) -> u64;
}

/// System clock without adjustment, for nodes with no peer time data.
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn adjusted_time(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}
