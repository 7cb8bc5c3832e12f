//! Shared test helpers: mock collaborators and transaction builders.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use ember_core::constants::{NetworkType, COIN};
use ember_core::pow::Sha256dHasher;
use ember_core::traits::{BlockSink, ChainView, Clock, MiningWallet, NetworkInfo, TipInfo};
use ember_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};
use ember_mempool::Mempool;
use ember_miner::assembler::AssemblerOptions;
use ember_miner::worker::MinerHandles;

/// Regtest-style compact bits: the easiest decodable target.
pub const EASY_BITS: u32 = 0x207f_ffff;

/// Compact bits whose target is zero: no hash can ever satisfy it.
pub const IMPOSSIBLE_BITS: u32 = 0x0100_0000;

/// Chain view with a mutable tip and fixed policy answers.
pub struct MockChain {
    tip: Mutex<TipInfo>,
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
pub struct FixedClock(AtomicU64);

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
pub struct MockNetwork {
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

/// Wallet stub handing out a fixed script and counting reservations kept.
pub struct MockWallet {
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
pub struct CollectSink {
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
pub fn p2pkh_script() -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[0x42; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

/// Transaction spending a confirmed outpoint derived from `seed`.
pub fn spend_confirmed(seed: u16) -> Transaction {
    let mut txid = [0u8; 32];
    txid[..2].copy_from_slice(&seed.to_le_bytes());
    txid[31] = 0xC0;
    spend(&[OutPoint {
        txid: Hash256(txid),
        index: 0,
    }])
}

/// Transaction spending the given outpoints.
pub fn spend(outpoints: &[OutPoint]) -> Transaction {
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
pub fn child_of(parent: Hash256) -> OutPoint {
    OutPoint {
        txid: parent,
        index: 0,
    }
}

/// Build a transaction with the exact consensus weight requested, by sizing
/// its scriptSig padding. Panics if the weight cannot be hit (too small).
pub fn tx_with_weight(seed: u16, target_weight: u64) -> Transaction {
    let mut tx = spend_confirmed(seed);
    for _ in 0..8 {
        let weight = tx.weight().expect("serializable");
        if weight == target_weight {
            return tx;
        }
        let current = tx.inputs[0].script_sig.len() as i64;
        let step = (target_weight as i64 - weight as i64) / 4;
        let next = current + step;
        assert!(next > 0, "target weight {target_weight} too small");
        tx.inputs[0].script_sig = vec![0; next as usize];
    }
    let weight = tx.weight().expect("serializable");
    assert_eq!(weight, target_weight, "could not hit target weight");
    tx
}

/// The full collaborator bundle around a fresh mempool and mock chain.
pub struct Harness {
    pub chain: Arc<MockChain>,
    pub pool: Arc<RwLock<Mempool>>,
    pub network: Arc<MockNetwork>,
    pub wallet: Arc<MockWallet>,
    pub sink: Arc<CollectSink>,
    pub clock: Arc<FixedClock>,
}

impl Harness {
    pub fn new(bits: u32) -> Self {
        Self {
            chain: Arc::new(MockChain::new(bits)),
            pool: Arc::new(RwLock::new(Mempool::new())),
            network: Arc::new(MockNetwork::online()),
            wallet: Arc::new(MockWallet::with_script()),
            sink: Arc::new(CollectSink::accepting()),
            clock: Arc::new(FixedClock::at(1_700_000_600)),
        }
    }

    /// Miner handles over this harness, with the fast test hasher.
    pub fn handles(&self, network_type: NetworkType, options: AssemblerOptions) -> MinerHandles {
        MinerHandles {
            network_type,
            options,
            chain: Arc::clone(&self.chain) as Arc<dyn ChainView>,
            mempool: Arc::clone(&self.pool),
            network: Arc::clone(&self.network) as Arc<dyn NetworkInfo>,
            wallet: Arc::clone(&self.wallet) as Arc<dyn MiningWallet>,
            sink: Arc::clone(&self.sink) as Arc<dyn BlockSink>,
            clock: Arc::clone(&self.clock) as Arc<dyn Clock>,
            hasher: Arc::new(Sha256dHasher),
        }
    }
}
