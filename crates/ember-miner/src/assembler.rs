//! Block assembly: fee-maximising package selection over the mempool's
//! dependency graph, and candidate-block construction.
//!
//! Selection orders the mempool by the fee rate of a transaction combined
//! with all of its unconfirmed ancestors. Entries are not removed from the
//! pool as they are selected, so the cached ancestor state of a descendant
//! goes stale the moment one of its ancestors enters the block; those
//! descendants get a temporary corrected entry in a modified set, and each
//! round compares the best modified entry with the next pool entry to decide
//! which package to work on.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};

use ember_core::constants::{
    COINBASE_SIGOPS_RESERVE, COINBASE_WEIGHT_RESERVE, DEFAULT_BLOCK_MAX_WEIGHT,
    DEFAULT_BLOCK_MIN_TX_FEE, MAX_BLOCK_SIGOPS_COST, MAX_BLOCK_WEIGHT,
    MAX_COINBASE_SCRIPT_SIG_SIZE, NetworkType, WITNESS_SCALE_FACTOR,
};
use ember_core::error::TemplateError;
use ember_core::feerate::{FeeRate, PackageScore};
use ember_core::merkle;
use ember_core::script;
use ember_core::traits::{ChainView, Clock, TipInfo};
use ember_core::types::{
    Block, BlockHeader, BlockTemplate, Hash256, OutPoint, Transaction, TxInput, TxOutput,
};
use ember_mempool::{Mempool, MempoolEntry};

/// Consecutive capacity failures tolerated before the selector gives up on a
/// nearly-full block.
const MAX_CONSECUTIVE_FAILURES: u64 = 1000;

/// Assembly policy knobs.
///
/// Loaded from node configuration; every field has a sane default and the
/// weight cap is clamped on construction of the [`BlockAssembler`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssemblerOptions {
    /// Maximum block weight to fill, coinbase reservation included.
    pub block_max_weight: u64,
    /// Minimum package fee rate; packages below it are never included.
    pub block_min_fee_rate: FeeRate,
    /// Version override, honored only on networks that mine on demand.
    pub block_version_override: Option<i32>,
    /// Log every transaction's fee rate as it enters the template.
    pub print_priority: bool,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            block_max_weight: DEFAULT_BLOCK_MAX_WEIGHT,
            block_min_fee_rate: FeeRate::from_per_kvb(DEFAULT_BLOCK_MIN_TX_FEE),
            block_version_override: None,
            print_priority: false,
        }
    }
}

/// A candidate package: one entry scored together with its not-yet-included
/// ancestors.
#[derive(Debug, Clone, Copy)]
struct Package {
    txid: Hash256,
    fees: i64,
    size: u64,
    sigops: i64,
}

impl Package {
    fn from_entry(entry: &MempoolEntry) -> Self {
        Self {
            txid: entry.txid(),
            fees: entry.fees_with_ancestors(),
            size: entry.size_with_ancestors(),
            sigops: entry.sigops_with_ancestors(),
        }
    }

    fn from_modified(entry: &ModifiedEntry) -> Self {
        Self {
            txid: entry.txid,
            fees: entry.fees_with_ancestors,
            size: entry.size_with_ancestors,
            sigops: entry.sigops_with_ancestors,
        }
    }
}

/// A pool entry whose cached ancestor state is stale because some of its
/// ancestors are already in the block: the aggregates here have those
/// contributions subtracted out.
#[derive(Debug, Clone, Copy)]
struct ModifiedEntry {
    txid: Hash256,
    size_with_ancestors: u64,
    fees_with_ancestors: i64,
    sigops_with_ancestors: i64,
}

impl ModifiedEntry {
    fn new(entry: &MempoolEntry) -> Self {
        Self {
            txid: entry.txid(),
            size_with_ancestors: entry.size_with_ancestors(),
            fees_with_ancestors: entry.fees_with_ancestors(),
            sigops_with_ancestors: entry.sigops_with_ancestors(),
        }
    }

    fn score(&self) -> PackageScore {
        PackageScore {
            fees: self.fees_with_ancestors,
            size: self.size_with_ancestors,
            txid: self.txid,
        }
    }
}

/// Dual-index set of [`ModifiedEntry`]: hash lookup by txid plus ordered
/// iteration by ancestor fee rate. Both indices are updated together.
#[derive(Default)]
struct ModifiedSet {
    by_txid: HashMap<Hash256, ModifiedEntry>,
    by_score: BTreeSet<PackageScore>,
}

impl ModifiedSet {
    fn contains(&self, txid: &Hash256) -> bool {
        self.by_txid.contains_key(txid)
    }

    /// The highest-scoring entry, if any.
    fn best(&self) -> Option<ModifiedEntry> {
        self.by_score
            .iter()
            .next()
            .and_then(|score| self.by_txid.get(&score.txid))
            .copied()
    }

    fn remove(&mut self, txid: &Hash256) {
        if let Some(entry) = self.by_txid.remove(txid) {
            self.by_score.remove(&entry.score());
        }
    }

    /// Subtract a newly-included ancestor's contribution from `descendant`,
    /// creating the modified entry from the pool state if absent.
    fn update_for_added(&mut self, descendant: &MempoolEntry, added: &MempoolEntry) {
        let mut entry = match self.by_txid.remove(&descendant.txid()) {
            Some(existing) => {
                self.by_score.remove(&existing.score());
                existing
            }
            None => ModifiedEntry::new(descendant),
        };
        entry.size_with_ancestors -= added.vsize();
        entry.fees_with_ancestors -= added.modified_fee();
        entry.sigops_with_ancestors -= added.sigop_cost();
        self.by_score.insert(entry.score());
        self.by_txid.insert(entry.txid, entry);
    }
}

/// Per-call selection state and running block totals.
struct Selection {
    height: u64,
    lock_time_cutoff: u64,
    include_witness: bool,
    block_max_weight: u64,
    block_min_fee_rate: FeeRate,
    print_priority: bool,
    in_block: HashSet<Hash256>,
    failed: HashSet<Hash256>,
    txs: Vec<Arc<Transaction>>,
    fees: Vec<i64>,
    sigop_costs: Vec<i64>,
    block_weight: u64,
    block_sigops: i64,
    total_fees: u64,
}

impl Selection {
    fn new(height: u64, lock_time_cutoff: u64, include_witness: bool, options: &AssemblerOptions) -> Self {
        Self {
            height,
            lock_time_cutoff,
            include_witness,
            block_max_weight: options.block_max_weight,
            block_min_fee_rate: options.block_min_fee_rate,
            print_priority: options.print_priority,
            in_block: HashSet::new(),
            failed: HashSet::new(),
            txs: Vec::new(),
            fees: Vec::new(),
            sigop_costs: Vec::new(),
            block_weight: COINBASE_WEIGHT_RESERVE,
            block_sigops: COINBASE_SIGOPS_RESERVE,
            total_fees: 0,
        }
    }

    /// Whether a package of the given virtual size and sigop cost still fits.
    fn test_package(&self, package_size: u64, package_sigops: i64) -> bool {
        if self.block_weight + WITNESS_SCALE_FACTOR * package_size >= self.block_max_weight {
            return false;
        }
        if self.block_sigops + package_sigops >= MAX_BLOCK_SIGOPS_COST {
            return false;
        }
        true
    }

    /// Transaction-level checks on a package: finality at the candidate
    /// height and cutoff, and no premature witness data.
    fn test_package_transactions(&self, pool: &Mempool, package: &HashSet<Hash256>) -> bool {
        package.iter().filter_map(|txid| pool.get(txid)).all(|entry| {
            entry.tx().is_final(self.height, self.lock_time_cutoff)
                && (self.include_witness || !entry.has_witness())
        })
    }

    /// Append one entry to the block and update every running total.
    fn add_to_block(&mut self, entry: &MempoolEntry) {
        self.txs.push(Arc::clone(entry.tx()));
        self.fees.push(entry.fee() as i64);
        self.sigop_costs.push(entry.sigop_cost());
        self.block_weight += entry.weight();
        self.block_sigops += entry.sigop_cost();
        self.total_fees += entry.fee();
        self.in_block.insert(entry.txid());

        if self.print_priority {
            let rate = FeeRate::from_fee(entry.modified_fee().max(0) as u64, entry.vsize());
            info!(fee_rate = %rate, txid = %entry.txid(), "added transaction to block template");
        }
    }

    /// The two-queue merge over the mempool's ancestor-score order and the
    /// modified set. Returns `(packages_selected, descendants_updated)`.
    fn add_package_txs(&mut self, pool: &Mempool) -> (usize, usize) {
        let mut modified = ModifiedSet::default();
        let mut packages_selected = 0usize;

        // Seed the modified set from anything already placed in the block,
        // so their descendants are scored without those ancestors. In the
        // normal path `in_block` is empty here and this is a no-op.
        let mut descendants_updated =
            update_packages_for_added(pool, &self.in_block, &mut modified);

        let mut mempool_iter = pool.ancestor_score_iter().peekable();
        let mut consecutive_failures = 0u64;

        loop {
            // Skip pool entries that are stale: already in the block, known
            // failures, or shadowed by a modified entry (whose corrected
            // aggregates are authoritative).
            while let Some(entry) = mempool_iter.peek() {
                let txid = entry.txid();
                if self.in_block.contains(&txid)
                    || self.failed.contains(&txid)
                    || modified.contains(&txid)
                {
                    mempool_iter.next();
                } else {
                    break;
                }
            }

            // Pick the better of the two fronts.
            let (candidate, using_modified) = match (mempool_iter.peek(), modified.best()) {
                (None, None) => break,
                (None, Some(best)) => (Package::from_modified(&best), true),
                (Some(&entry), None) => {
                    let package = Package::from_entry(entry);
                    mempool_iter.next();
                    (package, false)
                }
                (Some(&entry), Some(best)) => {
                    let pool_score = PackageScore {
                        fees: entry.fees_with_ancestors(),
                        size: entry.size_with_ancestors(),
                        txid: entry.txid(),
                    };
                    if best.score() < pool_score {
                        (Package::from_modified(&best), true)
                    } else {
                        let package = Package::from_entry(entry);
                        mempool_iter.next();
                        (package, false)
                    }
                }
            };

            debug_assert!(!self.in_block.contains(&candidate.txid));

            // Both views descend in fee rate, so everything after a
            // below-floor package is also below the floor.
            let floor = self.block_min_fee_rate.fee_for(candidate.size);
            if candidate.fees < i64::try_from(floor).unwrap_or(i64::MAX) {
                break;
            }

            if !self.test_package(candidate.size, candidate.sigops) {
                if using_modified {
                    // The best modified entry blocks the view until erased;
                    // record the failure so the pool walk skips it too.
                    modified.remove(&candidate.txid);
                    self.failed.insert(candidate.txid);
                }
                consecutive_failures += 1;
                if consecutive_failures > MAX_CONSECUTIVE_FAILURES
                    && self.block_weight > self.block_max_weight - COINBASE_WEIGHT_RESERVE
                {
                    // Close to full and nothing fits any more.
                    break;
                }
                continue;
            }

            // The actual ancestor set, restricted to what is not yet placed.
            let mut package = pool.calculate_ancestors(&candidate.txid);
            package.retain(|txid| !self.in_block.contains(txid));
            package.insert(candidate.txid);

            if !self.test_package_transactions(pool, &package) {
                if using_modified {
                    modified.remove(&candidate.txid);
                    self.failed.insert(candidate.txid);
                }
                consecutive_failures += 1;
                if consecutive_failures > MAX_CONSECUTIVE_FAILURES
                    && self.block_weight > self.block_max_weight - COINBASE_WEIGHT_RESERVE
                {
                    break;
                }
                continue;
            }

            // This package will make it in.
            consecutive_failures = 0;

            // Commit in dependency order: ascending ancestor count is a valid
            // topological order because a child always counts strictly more
            // ancestors than any of its parents.
            let mut sorted: Vec<&MempoolEntry> =
                package.iter().filter_map(|txid| pool.get(txid)).collect();
            sorted.sort_by_key(|entry| (entry.count_with_ancestors(), entry.txid()));
            for entry in sorted {
                self.add_to_block(entry);
                modified.remove(&entry.txid());
            }

            packages_selected += 1;
            descendants_updated += update_packages_for_added(pool, &package, &mut modified);
        }

        (packages_selected, descendants_updated)
    }
}

/// For every descendant of every entry in `added` (excluding `added`
/// itself), insert or update a modified entry with the added ancestors'
/// contributions subtracted. Returns the number of descendant updates.
fn update_packages_for_added(
    pool: &Mempool,
    added: &HashSet<Hash256>,
    modified: &mut ModifiedSet,
) -> usize {
    let mut descendants_updated = 0usize;
    for txid in added {
        let Some(added_entry) = pool.get(txid) else { continue };
        for descendant in pool.calculate_descendants(txid) {
            if added.contains(&descendant) {
                continue;
            }
            let Some(descendant_entry) = pool.get(&descendant) else { continue };
            descendants_updated += 1;
            modified.update_for_added(descendant_entry, added_entry);
        }
    }
    descendants_updated
}

/// Bump the header time to `max(median-time-past + 1, adjusted time)`.
///
/// Returns new time minus old time; a negative result means the wall clock
/// ran backwards past the header and the caller should rebuild. On networks
/// allowing min-difficulty blocks the required work depends on the time, so
/// the bits are refreshed as well.
pub fn update_time(
    header: &mut BlockHeader,
    network: NetworkType,
    chain: &dyn ChainView,
    clock: &dyn Clock,
    tip: &TipInfo,
) -> i64 {
    let old_time = i64::from(header.time);
    let new_time = (tip.median_time_past + 1).max(clock.adjusted_time()) as i64;
    if old_time < new_time {
        header.time = new_time as u32;
    }

    if network.allow_min_difficulty_blocks() {
        header.bits = chain.next_work_required(tip, header);
    }

    new_time - old_time
}

/// Refresh the coinbase scriptSig with the next extra nonce and recompute
/// the merkle root.
///
/// The extra nonce is worker-local state keyed on the previous-block hash:
/// it resets when the tip changes and increments otherwise, extending the
/// search space beyond the 32-bit header nonce.
pub fn increment_extra_nonce(
    block: &mut Block,
    tip: &TipInfo,
    last_prev_hash: &mut Hash256,
    extra_nonce: &mut u32,
) -> Result<(), TemplateError> {
    if *last_prev_hash != block.header.prev_hash {
        *extra_nonce = 0;
        *last_prev_hash = block.header.prev_hash;
    }
    *extra_nonce += 1;

    let height = tip.height + 1;
    let script_sig = script::coinbase_script_sig(height, *extra_nonce);
    if script_sig.len() > MAX_COINBASE_SCRIPT_SIG_SIZE {
        return Err(TemplateError::CoinbaseScriptSigTooLong {
            len: script_sig.len(),
            max: MAX_COINBASE_SCRIPT_SIG_SIZE,
        });
    }

    let Some(coinbase) = block.transactions.first_mut() else {
        debug_assert!(false, "template block has no coinbase");
        return Ok(());
    };
    let coinbase = Arc::make_mut(coinbase);
    if let Some(input) = coinbase.inputs.first_mut() {
        input.script_sig = script_sig;
    }

    let txids = block
        .transactions
        .iter()
        .map(|tx| tx.txid())
        .collect::<Result<Vec<_>, _>>()?;
    block.header.merkle_root = merkle::merkle_root(&txids);
    Ok(())
}

/// Builds candidate blocks from the live mempool and chain state.
pub struct BlockAssembler {
    network: NetworkType,
    options: AssemblerOptions,
    chain: Arc<dyn ChainView>,
    mempool: Arc<RwLock<Mempool>>,
    clock: Arc<dyn Clock>,
}

impl BlockAssembler {
    /// Create an assembler. The configured weight cap is clamped into
    /// `[4000, MAX_BLOCK_WEIGHT - 4000]` as a sanity guard.
    pub fn new(
        network: NetworkType,
        chain: Arc<dyn ChainView>,
        mempool: Arc<RwLock<Mempool>>,
        clock: Arc<dyn Clock>,
        mut options: AssemblerOptions,
    ) -> Self {
        options.block_max_weight = options
            .block_max_weight
            .clamp(COINBASE_WEIGHT_RESERVE, MAX_BLOCK_WEIGHT - COINBASE_WEIGHT_RESERVE);
        Self {
            network,
            options,
            chain,
            mempool,
            clock,
        }
    }

    /// The effective options after clamping.
    pub fn options(&self) -> &AssemblerOptions {
        &self.options
    }

    /// Assemble a new candidate block paying `coinbase_script`.
    ///
    /// Takes a tip snapshot and holds the mempool read lock for the whole of
    /// assembly, so entry handles and ancestor aggregates stay stable. The
    /// finished block is run through the consensus collaborator's validity
    /// check; a failure there is a bug in assembly, not a recoverable
    /// condition.
    pub fn create_new_block(
        &self,
        coinbase_script: &[u8],
        mine_witness: bool,
    ) -> Result<BlockTemplate, TemplateError> {
        let assembly_started = Instant::now();

        if coinbase_script.is_empty() {
            return Err(TemplateError::NoCoinbaseScript);
        }

        let tip = self.chain.tip();
        let height = tip.height + 1;

        let mut version = self.chain.compute_block_version(&tip);
        if self.network.mine_blocks_on_demand() {
            if let Some(override_version) = self.options.block_version_override {
                version = override_version;
            }
        }

        let provisional_time = self.clock.adjusted_time();
        // Standard lock-time flags evaluate finality against median-time-past
        // rather than the block's own timestamp.
        let lock_time_cutoff = tip.median_time_past;
        let include_witness = self.chain.is_witness_enabled(&tip) && mine_witness;

        let pool = self.mempool.read();
        let mut selection = Selection::new(height, lock_time_cutoff, include_witness, &self.options);
        let (packages_selected, descendants_updated) = selection.add_package_txs(&pool);

        let total_fees = selection.total_fees;
        let subsidy = self.chain.block_subsidy(height);

        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                script_sig: script::coinbase_script_sig(height, 0),
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput {
                value: subsidy + total_fees,
                script_pubkey: coinbase_script.to_vec(),
            }],
            witness: Vec::new(),
            lock_time: 0,
        };
        debug_assert!(coinbase.inputs[0].script_sig.len() <= MAX_COINBASE_SCRIPT_SIG_SIZE);
        let coinbase_sigops = WITNESS_SCALE_FACTOR as i64 * coinbase.legacy_sigop_count();

        let mut transactions = Vec::with_capacity(1 + selection.txs.len());
        transactions.push(Arc::new(coinbase));
        transactions.append(&mut selection.txs);

        let mut fees = Vec::with_capacity(transactions.len());
        fees.push(-(total_fees as i64));
        fees.append(&mut selection.fees);

        let mut sigop_costs = Vec::with_capacity(transactions.len());
        sigop_costs.push(coinbase_sigops);
        sigop_costs.append(&mut selection.sigop_costs);

        let txids = transactions
            .iter()
            .map(|tx| tx.txid())
            .collect::<Result<Vec<_>, _>>()?;

        let mut header = BlockHeader {
            version,
            prev_hash: tip.hash,
            merkle_root: merkle::merkle_root(&txids),
            time: provisional_time as u32,
            bits: 0,
            nonce: 0,
        };
        update_time(&mut header, self.network, self.chain.as_ref(), self.clock.as_ref(), &tip);
        header.bits = self.chain.next_work_required(&tip, &header);

        let block = Block { header, transactions };
        let coinbase_commitment = self.chain.coinbase_commitment(&block);

        info!(
            height,
            weight = selection.block_weight,
            txs = block.transactions.len() - 1,
            fees = total_fees,
            sigops = selection.block_sigops,
            "assembled block template"
        );

        let validity_started = Instant::now();
        self.chain
            .test_block_validity(&block, &tip)
            .map_err(TemplateError::ValidityFailed)?;

        debug!(
            packages = packages_selected,
            descendants_updated,
            assembly_us = assembly_started.elapsed().as_micros() as u64,
            validity_us = validity_started.elapsed().as_micros() as u64,
            "block template timings"
        );

        Ok(BlockTemplate {
            block,
            fees,
            sigop_costs,
            coinbase_commitment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        child_of, p2pkh_script, shared_pool, spend, spend_confirmed, FixedClock, MockChain,
    };
    use std::sync::atomic::Ordering;

    const EASY_BITS: u32 = 0x207f_ffff;
    const CLOCK_TIME: u64 = 1_700_000_600;

    fn assembler(
        network: NetworkType,
        chain: &Arc<MockChain>,
        pool: &Arc<RwLock<Mempool>>,
        options: AssemblerOptions,
    ) -> BlockAssembler {
        BlockAssembler::new(
            network,
            Arc::clone(chain) as Arc<dyn ChainView>,
            Arc::clone(pool),
            Arc::new(FixedClock::at(CLOCK_TIME)),
            options,
        )
    }

    fn default_assembler(
        chain: &Arc<MockChain>,
        pool: &Arc<RwLock<Mempool>>,
    ) -> BlockAssembler {
        assembler(NetworkType::Mainnet, chain, pool, AssemblerOptions::default())
    }

    // ------------------------------------------------------------------
    // Options
    // ------------------------------------------------------------------

    #[test]
    fn weight_cap_is_clamped_both_ways() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let pool = shared_pool();

        let huge = assembler(
            NetworkType::Mainnet,
            &chain,
            &pool,
            AssemblerOptions { block_max_weight: u64::MAX, ..Default::default() },
        );
        assert_eq!(
            huge.options().block_max_weight,
            MAX_BLOCK_WEIGHT - COINBASE_WEIGHT_RESERVE
        );

        let tiny = assembler(
            NetworkType::Mainnet,
            &chain,
            &pool,
            AssemblerOptions { block_max_weight: 1, ..Default::default() },
        );
        assert_eq!(tiny.options().block_max_weight, COINBASE_WEIGHT_RESERVE);
    }

    // ------------------------------------------------------------------
    // Template construction
    // ------------------------------------------------------------------

    #[test]
    fn empty_mempool_yields_coinbase_only() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let pool = shared_pool();
        let template = default_assembler(&chain, &pool)
            .create_new_block(&p2pkh_script(), true)
            .unwrap();

        assert_eq!(template.block.transactions.len(), 1);
        let coinbase = template.block.coinbase().unwrap();
        assert!(coinbase.is_coinbase());
        assert_eq!(coinbase.outputs[0].value, chain.subsidy);
        assert_eq!(template.fees, vec![0]);
        assert_eq!(template.sigop_costs.len(), 1);
        assert!(!template.coinbase_commitment.is_empty());
        assert_eq!(chain.validity_checks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn header_fields_come_from_collaborators() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let pool = shared_pool();
        let template = default_assembler(&chain, &pool)
            .create_new_block(&p2pkh_script(), true)
            .unwrap();

        let header = &template.block.header;
        let tip = chain.tip();
        assert_eq!(header.prev_hash, tip.hash);
        assert_eq!(header.bits, EASY_BITS);
        assert_eq!(header.version, chain.version);
        assert_eq!(header.nonce, 0);
        assert_eq!(u64::from(header.time), CLOCK_TIME);

        let txids: Vec<Hash256> = template
            .block
            .transactions
            .iter()
            .map(|tx| tx.txid().unwrap())
            .collect();
        assert_eq!(header.merkle_root, merkle::merkle_root(&txids));
    }

    #[test]
    fn independent_txs_ordered_by_fee_and_fees_recorded() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let pool = shared_pool();
        let (a, b) = {
            let mut pool = pool.write();
            let a = pool.insert(spend_confirmed(1), 1000, 4).unwrap();
            let b = pool.insert(spend_confirmed(2), 500, 4).unwrap();
            (a, b)
        };

        let template = default_assembler(&chain, &pool)
            .create_new_block(&p2pkh_script(), true)
            .unwrap();

        let txids: Vec<Hash256> = template
            .block
            .transactions
            .iter()
            .map(|tx| tx.txid().unwrap())
            .collect();
        assert_eq!(txids.len(), 3);
        assert_eq!(txids[1], a);
        assert_eq!(txids[2], b);

        assert_eq!(template.fees, vec![-1500, 1000, 500]);
        assert_eq!(
            template.block.coinbase().unwrap().outputs[0].value,
            chain.subsidy + 1500
        );
    }

    #[test]
    fn high_fee_child_pulls_in_low_fee_parent() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let pool = shared_pool();
        let (parent, child) = {
            let mut pool = pool.write();
            let parent = pool.insert(spend_confirmed(1), 100, 4).unwrap();
            let child = pool.insert(spend(&[child_of(parent)]), 900, 4).unwrap();
            (parent, child)
        };

        let template = default_assembler(&chain, &pool)
            .create_new_block(&p2pkh_script(), true)
            .unwrap();

        let txids: Vec<Hash256> = template
            .block
            .transactions
            .iter()
            .map(|tx| tx.txid().unwrap())
            .collect();
        // The parent alone is below the fee floor, but the package carries it,
        // and dependency order puts it first.
        assert_eq!(txids, vec![txids[0], parent, child]);
        assert_eq!(template.fees, vec![-1000, 100, 900]);
    }

    #[test]
    fn below_floor_package_is_excluded() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let pool = shared_pool();
        let high = {
            let mut pool = pool.write();
            let high = pool.insert(spend_confirmed(1), 5000, 4).unwrap();
            // Well under 1000 embers/kvB on its own.
            pool.insert(spend_confirmed(2), 10, 4).unwrap();
            high
        };

        let template = default_assembler(&chain, &pool)
            .create_new_block(&p2pkh_script(), true)
            .unwrap();

        let txids: Vec<Hash256> = template
            .block
            .transactions
            .iter()
            .map(|tx| tx.txid().unwrap())
            .collect();
        assert_eq!(txids.len(), 2);
        assert_eq!(txids[1], high);
    }

    #[test]
    fn weight_cap_limits_selection() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let pool = shared_pool();
        let vsize = spend_confirmed(1).vsize().unwrap();
        let high = {
            let mut pool = pool.write();
            let high = pool.insert(spend_confirmed(1), 9000, 4).unwrap();
            pool.insert(spend_confirmed(2), 8000, 4).unwrap();
            high
        };

        // Room for exactly one transaction beside the coinbase reserve.
        let options = AssemblerOptions {
            block_max_weight: COINBASE_WEIGHT_RESERVE + 8 * vsize,
            ..Default::default()
        };
        let template = assembler(NetworkType::Mainnet, &chain, &pool, options)
            .create_new_block(&p2pkh_script(), true)
            .unwrap();

        let txids: Vec<Hash256> = template
            .block
            .transactions
            .iter()
            .map(|tx| tx.txid().unwrap())
            .collect();
        assert_eq!(txids.len(), 2);
        assert_eq!(txids[1], high);
    }

    #[test]
    fn sigop_cap_limits_selection() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let pool = shared_pool();
        let small = {
            let mut pool = pool.write();
            // Highest fee but eats the whole sigop budget.
            pool.insert(
                spend_confirmed(1),
                50_000,
                MAX_BLOCK_SIGOPS_COST - COINBASE_SIGOPS_RESERVE,
            )
            .unwrap();
            pool.insert(spend_confirmed(2), 1000, 4).unwrap()
        };

        let template = default_assembler(&chain, &pool)
            .create_new_block(&p2pkh_script(), true)
            .unwrap();

        let txids: Vec<Hash256> = template
            .block
            .transactions
            .iter()
            .map(|tx| tx.txid().unwrap())
            .collect();
        assert_eq!(txids.len(), 2);
        assert_eq!(txids[1], small);
    }

    #[test]
    fn non_final_tx_excluded_regardless_of_fee() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let pool = shared_pool();
        {
            let mut pool = pool.write();
            let mut tx = spend_confirmed(1);
            // Height-based lock far in the future, with lock-time enforced.
            tx.lock_time = 1_000;
            tx.inputs[0].sequence = 0;
            pool.insert(tx, 100_000, 4).unwrap();
        }

        let template = default_assembler(&chain, &pool)
            .create_new_block(&p2pkh_script(), true)
            .unwrap();
        assert_eq!(template.block.transactions.len(), 1);
    }

    #[test]
    fn time_locked_tx_judged_against_median_time_past() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let pool = shared_pool();
        let mtp = chain.tip().median_time_past;
        let (final_tx, non_final_tx) = {
            let mut pool = pool.write();
            let mut final_tx = spend_confirmed(1);
            final_tx.lock_time = (mtp - 1) as u32;
            final_tx.inputs[0].sequence = 0;
            let mut non_final_tx = spend_confirmed(2);
            // Final relative to the wall clock, but not to median-time-past.
            non_final_tx.lock_time = mtp as u32;
            non_final_tx.inputs[0].sequence = 0;
            (
                pool.insert(final_tx, 5000, 4).unwrap(),
                pool.insert(non_final_tx, 5000, 4).unwrap(),
            )
        };

        let template = default_assembler(&chain, &pool)
            .create_new_block(&p2pkh_script(), true)
            .unwrap();

        let txids: Vec<Hash256> = template
            .block
            .transactions
            .iter()
            .map(|tx| tx.txid().unwrap())
            .collect();
        assert!(txids.contains(&final_tx));
        assert!(!txids.contains(&non_final_tx));
    }

    #[test]
    fn witness_txs_gated_on_activation_and_request() {
        let witness_tx = {
            let mut tx = spend_confirmed(1);
            tx.witness = vec![vec![vec![0u8; 64]]];
            tx
        };

        for (enabled, requested, expected_txs) in
            [(true, true, 2), (true, false, 1), (false, true, 1)]
        {
            let mut chain = MockChain::new(EASY_BITS);
            chain.witness_enabled = enabled;
            let chain = Arc::new(chain);
            let pool = shared_pool();
            pool.write().insert(witness_tx.clone(), 5000, 4).unwrap();

            let template = default_assembler(&chain, &pool)
                .create_new_block(&p2pkh_script(), requested)
                .unwrap();
            assert_eq!(template.block.transactions.len(), expected_txs);
        }
    }

    #[test]
    fn version_override_honored_only_on_demand_networks() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let pool = shared_pool();
        let options = AssemblerOptions {
            block_version_override: Some(0x2000_0000),
            ..Default::default()
        };

        let regtest = assembler(NetworkType::Regtest, &chain, &pool, options.clone())
            .create_new_block(&p2pkh_script(), true)
            .unwrap();
        assert_eq!(regtest.block.header.version, 0x2000_0000);

        let mainnet = assembler(NetworkType::Mainnet, &chain, &pool, options)
            .create_new_block(&p2pkh_script(), true)
            .unwrap();
        assert_eq!(mainnet.block.header.version, chain.version);
    }

    #[test]
    fn empty_coinbase_script_is_an_error() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let pool = shared_pool();
        let err = default_assembler(&chain, &pool)
            .create_new_block(&[], true)
            .unwrap_err();
        assert_eq!(err, TemplateError::NoCoinbaseScript);
    }

    #[test]
    fn validity_failure_is_fatal_for_the_call() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        chain.reject_validity.store(true, Ordering::SeqCst);
        let pool = shared_pool();
        let err = default_assembler(&chain, &pool)
            .create_new_block(&p2pkh_script(), true)
            .unwrap_err();
        assert!(matches!(err, TemplateError::ValidityFailed(_)));
    }

    #[test]
    fn templates_are_deterministic_for_a_frozen_pool() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let pool = shared_pool();
        {
            let mut pool = pool.write();
            let a = pool.insert(spend_confirmed(1), 2000, 4).unwrap();
            pool.insert(spend(&[child_of(a)]), 7000, 4).unwrap();
            pool.insert(spend_confirmed(2), 4000, 4).unwrap();
            pool.insert(spend_confirmed(3), 4000, 4).unwrap();
        }

        let asm = default_assembler(&chain, &pool);
        let first = asm.create_new_block(&p2pkh_script(), true).unwrap();
        let second = asm.create_new_block(&p2pkh_script(), true).unwrap();
        assert_eq!(first.block, second.block);
        assert_eq!(first.fees, second.fees);
    }

    #[test]
    fn fee_sentinel_matches_sum() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let pool = shared_pool();
        {
            let mut pool = pool.write();
            pool.insert(spend_confirmed(1), 2500, 4).unwrap();
            pool.insert(spend_confirmed(2), 1500, 4).unwrap();
        }

        let template = default_assembler(&chain, &pool)
            .create_new_block(&p2pkh_script(), true)
            .unwrap();
        let rest: i64 = template.fees[1..].iter().sum();
        assert_eq!(template.fees[0], -rest);
        assert_eq!(template.fees.len(), template.block.transactions.len());
        assert_eq!(template.sigop_costs.len(), template.block.transactions.len());
    }

    // ------------------------------------------------------------------
    // Selection internals
    // ------------------------------------------------------------------

    #[test]
    fn seeded_in_block_discounts_ancestors() {
        let mut pool = Mempool::new();
        let parent = pool.insert(spend_confirmed(1), 100, 4).unwrap();
        let child = pool.insert(spend(&[child_of(parent)]), 9000, 4).unwrap();

        let options = AssemblerOptions::default();
        let mut selection = Selection::new(101, 0, true, &options);
        selection.in_block.insert(parent);

        let (packages, descendants) = selection.add_package_txs(&pool);
        assert_eq!(packages, 1);
        assert!(descendants >= 1);
        // Only the child was appended; the seeded parent is not re-added.
        assert_eq!(selection.txs.len(), 1);
        assert_eq!(selection.txs[0].txid().unwrap(), child);
        assert_eq!(selection.total_fees, 9000);
    }

    #[test]
    fn modified_sourced_failures_are_recorded_mempool_sourced_are_not() {
        let options = AssemblerOptions {
            // Clamped to the 4000 floor: nothing beyond the coinbase fits.
            block_max_weight: 4000,
            ..Default::default()
        };

        // Mempool-sourced failure: entry walks in from the pool view.
        let mut pool = Mempool::new();
        let standalone = pool.insert(spend_confirmed(1), 100_000, 4).unwrap();
        let mut selection = Selection::new(101, 0, true, &options);
        let (packages, _) = selection.add_package_txs(&pool);
        assert_eq!(packages, 0);
        assert!(!selection.failed.contains(&standalone));

        // Modified-sourced failure: the child is considered via the modified
        // set because its parent is already in the block.
        let mut pool = Mempool::new();
        let parent = pool.insert(spend_confirmed(2), 100, 4).unwrap();
        let child = pool.insert(spend(&[child_of(parent)]), 100_000, 4).unwrap();
        let mut selection = Selection::new(101, 0, true, &options);
        selection.in_block.insert(parent);
        let (packages, _) = selection.add_package_txs(&pool);
        assert_eq!(packages, 0);
        assert!(selection.failed.contains(&child));
    }

    #[test]
    fn modified_set_keeps_both_indices_in_step() {
        let mut pool = Mempool::new();
        let parent = pool.insert(spend_confirmed(1), 1000, 4).unwrap();
        let child = pool.insert(spend(&[child_of(parent)]), 3000, 4).unwrap();
        let parent_entry = pool.get(&parent).unwrap();
        let child_entry = pool.get(&child).unwrap();

        let mut modified = ModifiedSet::default();
        modified.update_for_added(child_entry, parent_entry);

        assert!(modified.contains(&child));
        let best = modified.best().unwrap();
        assert_eq!(best.txid, child);
        assert_eq!(best.fees_with_ancestors, 3000);
        assert_eq!(best.size_with_ancestors, child_entry.vsize());
        assert_eq!(best.sigops_with_ancestors, 4);

        modified.remove(&child);
        assert!(!modified.contains(&child));
        assert!(modified.best().is_none());
        assert!(modified.by_score.is_empty());
    }

    // ------------------------------------------------------------------
    // update_time
    // ------------------------------------------------------------------

    #[test]
    fn update_time_moves_header_forward() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let clock = FixedClock::at(CLOCK_TIME + 50);
        let tip = chain.tip();
        let mut header = BlockHeader {
            version: 1,
            prev_hash: tip.hash,
            merkle_root: Hash256::ZERO,
            time: CLOCK_TIME as u32,
            bits: 0,
            nonce: 0,
        };

        let delta = update_time(&mut header, NetworkType::Mainnet, chain.as_ref(), &clock, &tip);
        assert_eq!(delta, 50);
        assert_eq!(u64::from(header.time), CLOCK_TIME + 50);
        // Mainnet never refreshes the bits here.
        assert_eq!(header.bits, 0);
    }

    #[test]
    fn update_time_reports_backwards_clock_without_rewinding() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let clock = FixedClock::at(CLOCK_TIME - 100);
        let tip = chain.tip();
        let mut header = BlockHeader {
            version: 1,
            prev_hash: tip.hash,
            merkle_root: Hash256::ZERO,
            time: CLOCK_TIME as u32,
            bits: 0,
            nonce: 0,
        };

        let delta = update_time(&mut header, NetworkType::Mainnet, chain.as_ref(), &clock, &tip);
        assert!(delta < 0);
        // The header keeps its original (later) time.
        assert_eq!(u64::from(header.time), CLOCK_TIME);
    }

    #[test]
    fn update_time_never_goes_below_median_time_past() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let tip = chain.tip();
        let clock = FixedClock::at(tip.median_time_past - 500);
        let mut header = BlockHeader {
            version: 1,
            prev_hash: tip.hash,
            merkle_root: Hash256::ZERO,
            time: 0,
            bits: 0,
            nonce: 0,
        };

        update_time(&mut header, NetworkType::Mainnet, chain.as_ref(), &clock, &tip);
        assert_eq!(u64::from(header.time), tip.median_time_past + 1);
    }

    #[test]
    fn update_time_refreshes_bits_on_min_difficulty_networks() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let clock = FixedClock::at(CLOCK_TIME);
        let tip = chain.tip();
        let mut header = BlockHeader {
            version: 1,
            prev_hash: tip.hash,
            merkle_root: Hash256::ZERO,
            time: 0,
            bits: 0,
            nonce: 0,
        };

        update_time(&mut header, NetworkType::Testnet, chain.as_ref(), &clock, &tip);
        assert_eq!(header.bits, EASY_BITS);
    }

    // ------------------------------------------------------------------
    // increment_extra_nonce
    // ------------------------------------------------------------------

    #[test]
    fn extra_nonce_increments_and_rewrites_coinbase() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let pool = shared_pool();
        let mut template = default_assembler(&chain, &pool)
            .create_new_block(&p2pkh_script(), true)
            .unwrap();
        let tip = chain.tip();

        let mut last_prev_hash = Hash256::ZERO;
        let mut extra_nonce = 0u32;

        increment_extra_nonce(&mut template.block, &tip, &mut last_prev_hash, &mut extra_nonce)
            .unwrap();
        assert_eq!(extra_nonce, 1);
        assert_eq!(last_prev_hash, tip.hash);
        assert_eq!(
            template.block.coinbase().unwrap().inputs[0].script_sig,
            script::coinbase_script_sig(tip.height + 1, 1)
        );

        // The merkle root tracks the rewritten coinbase.
        let txids: Vec<Hash256> = template
            .block
            .transactions
            .iter()
            .map(|tx| tx.txid().unwrap())
            .collect();
        assert_eq!(template.block.header.merkle_root, merkle::merkle_root(&txids));

        increment_extra_nonce(&mut template.block, &tip, &mut last_prev_hash, &mut extra_nonce)
            .unwrap();
        assert_eq!(extra_nonce, 2);
    }

    #[test]
    fn extra_nonce_resets_when_tip_changes() {
        let chain = Arc::new(MockChain::new(EASY_BITS));
        let pool = shared_pool();
        let asm = default_assembler(&chain, &pool);
        let mut last_prev_hash = Hash256::ZERO;
        let mut extra_nonce = 0u32;

        let mut template = asm.create_new_block(&p2pkh_script(), true).unwrap();
        let tip = chain.tip();
        increment_extra_nonce(&mut template.block, &tip, &mut last_prev_hash, &mut extra_nonce)
            .unwrap();
        increment_extra_nonce(&mut template.block, &tip, &mut last_prev_hash, &mut extra_nonce)
            .unwrap();
        assert_eq!(extra_nonce, 2);

        chain.advance_tip();
        let new_tip = chain.tip();
        let mut rebuilt = asm.create_new_block(&p2pkh_script(), true).unwrap();
        increment_extra_nonce(&mut rebuilt.block, &new_tip, &mut last_prev_hash, &mut extra_nonce)
            .unwrap();
        assert_eq!(extra_nonce, 1);
        assert_eq!(last_prev_hash, new_tip.hash);
    }
}
