//! Shared mocks and fixtures for the miner's unit tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use ember_core::constants::COIN;
use ember_core::traits::{BlockSink, ChainView, Clock, MiningWallet, NetworkInfo, TipInfo};
use ember_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};
use ember_mempool::Mempool;

/// Chain view with a mutable tip and fixed policy answers.
pub(crate) struct MockChain {
    pub tip: Mutex<TipInfo>,
    pub bits: u32,
    pub subsidy: u64,
    pub witness_enabled: bool,
    pub version: i32,
    pub reject_validity: AtomicBool,
    pub validity_checks: AtomicUsize,
}

impl MockChain {
    pub fn new(bits: u32) -> Self {
        Self {
            tip: Mutex::new(TipInfo {
                hash: Hash256([0xAA; 32]),
                height: 100,
                median_time_past: 1_700_000_000,
            }),
            bits,
            subsidy: 50 * COIN,
            witness_enabled: true,
            version: 4,
            reject_validity: AtomicBool::new(false),
            validity_checks: AtomicUsize::new(0),
        }
    }

    /// Move the tip forward one block, changing its hash.
    pub fn advance_tip(&self) {
        let mut tip = self.tip.lock();
        tip.height += 1;
        let mut hash = [0u8; 32];
        hash[..8].copy_from_slice(&tip.height.to_le_bytes());
        tip.hash = Hash256(hash);
    }
}

impl ChainView for MockChain {
    fn tip(&self) -> TipInfo {
        self.tip.lock().clone()
    }

    fn is_witness_enabled(&self, _tip: &TipInfo) -> bool {
        self.witness_enabled
    }

    fn next_work_required(&self, _tip: &TipInfo, _header: &BlockHeader) -> u32 {
        self.bits
    }

    fn block_subsidy(&self, _height: u64) -> u64 {
        self.subsidy
    }

    fn compute_block_version(&self, _tip: &TipInfo) -> i32 {
        self.version
    }

    fn coinbase_commitment(&self, _block: &Block) -> Vec<u8> {
        vec![0x6a, 0x24]
    }

    fn test_block_validity(&self, _block: &Block, _tip: &TipInfo) -> Result<(), String> {
        self.validity_checks.fetch_add(1, Ordering::SeqCst);
        if self.reject_validity.load(Ordering::SeqCst) {
            Err("forced validity failure".into())
        } else {
            Ok(())
        }
    }
}

/// Clock pinned to a settable instant.
pub(crate) struct FixedClock(pub AtomicU64);

impl FixedClock {
    pub fn at(time: u64) -> Self {
        Self(AtomicU64::new(time))
    }

    pub fn set(&self, time: u64) {
        self.0.store(time, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn adjusted_time(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Connection-manager stub with settable peer count and IBD flag.
pub(crate) struct MockNetwork {
    pub peers: AtomicUsize,
    pub ibd: AtomicBool,
}

impl MockNetwork {
    pub fn online() -> Self {
        Self {
            peers: AtomicUsize::new(8),
            ibd: AtomicBool::new(false),
        }
    }
}

impl NetworkInfo for MockNetwork {
    fn peer_count(&self) -> usize {
        self.peers.load(Ordering::SeqCst)
    }

    fn is_initial_block_download(&self) -> bool {
        self.ibd.load(Ordering::SeqCst)
    }
}

/// Wallet stub handing out a fixed script.
pub(crate) struct MockWallet {
    pub script: Option<Vec<u8>>,
    pub kept: AtomicUsize,
}

impl MockWallet {
    pub fn with_script() -> Self {
        Self {
            script: Some(p2pkh_script()),
            kept: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self {
            script: None,
            kept: AtomicUsize::new(0),
        }
    }
}

impl MiningWallet for MockWallet {
    fn script_for_mining(&self) -> Option<Vec<u8>> {
        self.script.clone()
    }

    fn keep_script(&self) {
        self.kept.fetch_add(1, Ordering::SeqCst);
    }
}

/// Block sink that records every submission.
pub(crate) struct CollectSink {
    pub accept: AtomicBool,
    pub blocks: Mutex<Vec<Block>>,
}

impl CollectSink {
    pub fn accepting() -> Self {
        Self {
            accept: AtomicBool::new(true),
            blocks: Mutex::new(Vec::new()),
        }
    }
}

impl BlockSink for CollectSink {
    fn process_new_block(&self, block: &Block, _force_processing: bool) -> bool {
        self.blocks.lock().push(block.clone());
        self.accept.load(Ordering::SeqCst)
    }
}

/// A standard-looking pay-to-pubkey-hash output script.
pub(crate) fn p2pkh_script() -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[0x42; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

/// Transaction spending a confirmed outpoint derived from `seed`.
pub(crate) fn spend_confirmed(seed: u8) -> Transaction {
    spend(&[OutPoint {
        txid: Hash256([seed; 32]),
        index: 0,
    }])
}

/// Transaction spending the given outpoints.
pub(crate) fn spend(outpoints: &[OutPoint]) -> Transaction {
    Transaction {
        version: 1,
        inputs: outpoints
            .iter()
            .map(|outpoint| TxInput {
                previous_output: outpoint.clone(),
                script_sig: vec![0; 70],
                sequence: u32::MAX,
            })
            .collect(),
        outputs: vec![TxOutput {
            value: 40 * COIN,
            script_pubkey: p2pkh_script(),
        }],
        witness: Vec::new(),
        lock_time: 0,
    }
}

/// Outpoint referencing output 0 of an in-pool transaction.
pub(crate) fn child_of(parent: Hash256) -> OutPoint {
    OutPoint {
        txid: parent,
        index: 0,
    }
}

/// A fresh mempool behind the lock the assembler expects.
pub(crate) fn shared_pool() -> Arc<RwLock<Mempool>> {
    Arc::new(RwLock::new(Mempool::new()))
}
