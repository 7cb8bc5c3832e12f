//! In-memory pool of unconfirmed transactions with ancestor accounting.
//!
//! Unconfirmed transactions often depend on other unconfirmed transactions.
//! Block assembly scores a transaction together with all of its in-pool
//! ancestors, so every entry carries aggregate size, fee, and sigop totals
//! over its ancestor set, and the pool maintains an index ordered by that
//! ancestor fee rate:
//! - O(1) lookup by txid
//! - O(log n) ordered iteration by ancestor fee rate (highest first)
//! - ancestor / descendant closure queries over the in-pool dependency graph
//!
//! Transactions must be validated by the caller before insertion; the pool
//! checks only duplicates and input conflicts. The pool is not thread-safe —
//! callers wrap it in a `RwLock` (the assembler holds the read side for the
//! whole of template construction so entries and aggregates stay stable).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use ember_core::error::MempoolError;
use ember_core::feerate::PackageScore;
use ember_core::types::{Block, Hash256, OutPoint, Transaction};

/// A transaction stored in the mempool with precomputed metadata and
/// ancestor aggregates.
///
/// The `*_with_ancestors` fields include the entry's own contribution.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    tx: Arc<Transaction>,
    txid: Hash256,
    fee: u64,
    modified_fee: i64,
    vsize: u64,
    weight: u64,
    sigop_cost: i64,
    parents: HashSet<Hash256>,
    children: HashSet<Hash256>,
    count_with_ancestors: u64,
    size_with_ancestors: u64,
    fees_with_ancestors: i64,
    sigops_with_ancestors: i64,
}

impl MempoolEntry {
    /// The transaction body.
    pub fn tx(&self) -> &Arc<Transaction> {
        &self.tx
    }

    /// Transaction ID.
    pub fn txid(&self) -> Hash256 {
        self.txid
    }

    /// Raw fee in embers.
    pub fn fee(&self) -> u64 {
        self.fee
    }

    /// Fee after prioritisation deltas. This is what selection scores.
    pub fn modified_fee(&self) -> i64 {
        self.modified_fee
    }

    /// Virtual size in bytes.
    pub fn vsize(&self) -> u64 {
        self.vsize
    }

    /// Consensus weight.
    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// Signature-operation cost.
    pub fn sigop_cost(&self) -> i64 {
        self.sigop_cost
    }

    /// Whether the transaction carries witness data.
    pub fn has_witness(&self) -> bool {
        self.tx.has_witness()
    }

    /// Number of transactions in the ancestor set, including this one.
    pub fn count_with_ancestors(&self) -> u64 {
        self.count_with_ancestors
    }

    /// Virtual size of the ancestor set, including this entry.
    pub fn size_with_ancestors(&self) -> u64 {
        self.size_with_ancestors
    }

    /// Modified fees of the ancestor set, including this entry.
    pub fn fees_with_ancestors(&self) -> i64 {
        self.fees_with_ancestors
    }

    /// Sigop cost of the ancestor set, including this entry.
    pub fn sigops_with_ancestors(&self) -> i64 {
        self.sigops_with_ancestors
    }

    /// In-pool parents (direct dependencies).
    pub fn parents(&self) -> &HashSet<Hash256> {
        &self.parents
    }

    /// Ordering key for the ancestor-score index.
    fn score(&self) -> PackageScore {
        PackageScore {
            fees: self.fees_with_ancestors,
            size: self.size_with_ancestors,
            txid: self.txid,
        }
    }
}

/// In-memory pool of unconfirmed transactions.
#[derive(Default)]
pub struct Mempool {
    /// Primary storage: txid → entry.
    entries: HashMap<Hash256, MempoolEntry>,
    /// Spent outpoint → txid of the pool transaction that spends it.
    by_outpoint: HashMap<OutPoint, Hash256>,
    /// Entries ordered by ancestor fee rate, best first.
    by_ancestor_score: BTreeSet<PackageScore>,
}

impl Mempool {
    /// Create an empty mempool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a validated transaction.
    ///
    /// `fee` is the raw fee; `sigop_cost` comes from the caller's script
    /// analysis. In-pool parents are discovered from the inputs and the
    /// entry's ancestor aggregates are computed over their closure.
    ///
    /// Returns the txid on success.
    pub fn insert(
        &mut self,
        tx: Transaction,
        fee: u64,
        sigop_cost: i64,
    ) -> Result<Hash256, MempoolError> {
        let txid = tx.txid()?;

        if tx.is_coinbase() {
            return Err(MempoolError::Coinbase(txid.to_string()));
        }
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyExists(txid.to_string()));
        }
        for input in &tx.inputs {
            if let Some(existing) = self.by_outpoint.get(&input.previous_output) {
                return Err(MempoolError::Conflict {
                    new_txid: txid.to_string(),
                    existing_txid: existing.to_string(),
                    outpoint: input.previous_output.to_string(),
                });
            }
        }

        let vsize = tx.vsize()?;
        let weight = tx.weight()?;

        // Direct in-pool parents, then their full ancestor closure.
        let parents: HashSet<Hash256> = tx
            .inputs
            .iter()
            .map(|input| input.previous_output.txid)
            .filter(|parent| self.entries.contains_key(parent))
            .collect();
        let ancestors = self.closure_over(&parents, |entry| &entry.parents);

        let mut size_with_ancestors = vsize;
        let mut fees_with_ancestors = fee as i64;
        let mut sigops_with_ancestors = sigop_cost;
        for ancestor in &ancestors {
            if let Some(entry) = self.entries.get(ancestor) {
                size_with_ancestors += entry.vsize;
                fees_with_ancestors += entry.modified_fee;
                sigops_with_ancestors += entry.sigop_cost;
            }
        }

        for parent in &parents {
            if let Some(entry) = self.entries.get_mut(parent) {
                entry.children.insert(txid);
            }
        }
        for input in &tx.inputs {
            self.by_outpoint.insert(input.previous_output.clone(), txid);
        }

        let entry = MempoolEntry {
            tx: Arc::new(tx),
            txid,
            fee,
            modified_fee: fee as i64,
            vsize,
            weight,
            sigop_cost,
            parents,
            children: HashSet::new(),
            count_with_ancestors: 1 + ancestors.len() as u64,
            size_with_ancestors,
            fees_with_ancestors,
            sigops_with_ancestors,
        };
        self.by_ancestor_score.insert(entry.score());
        self.entries.insert(txid, entry);

        Ok(txid)
    }

    /// Adjust an entry's modified fee by `delta` embers.
    ///
    /// Propagates into the ancestor aggregates of the entry and every in-pool
    /// descendant, re-keying the score index as it goes. No-op for unknown
    /// txids.
    pub fn prioritise(&mut self, txid: &Hash256, delta: i64) {
        if !self.entries.contains_key(txid) {
            return;
        }
        if let Some(entry) = self.entries.get_mut(txid) {
            entry.modified_fee += delta;
        }
        for descendant in self.calculate_descendants(txid) {
            if let Some(entry) = self.entries.get_mut(&descendant) {
                self.by_ancestor_score.remove(&entry.score());
                entry.fees_with_ancestors += delta;
                self.by_ancestor_score.insert(entry.score());
            }
        }
        debug!(%txid, delta, "prioritised mempool entry");
    }

    /// All in-pool ancestors of `txid`, excluding the entry itself.
    ///
    /// No limits are applied; block assembly needs the full closure.
    pub fn calculate_ancestors(&self, txid: &Hash256) -> HashSet<Hash256> {
        let seed = match self.entries.get(txid) {
            Some(entry) => entry.parents.clone(),
            None => return HashSet::new(),
        };
        self.closure_over(&seed, |entry| &entry.parents)
    }

    /// All in-pool descendants of `txid`, including the entry itself.
    pub fn calculate_descendants(&self, txid: &Hash256) -> HashSet<Hash256> {
        if !self.entries.contains_key(txid) {
            return HashSet::new();
        }
        let mut seed = HashSet::new();
        seed.insert(*txid);
        let mut closure = self.closure_over(&seed, |entry| &entry.children);
        closure.insert(*txid);
        closure
    }

    /// Transitive closure over `link` starting from `seed` (seed included).
    fn closure_over(
        &self,
        seed: &HashSet<Hash256>,
        link: impl Fn(&MempoolEntry) -> &HashSet<Hash256>,
    ) -> HashSet<Hash256> {
        let mut closure: HashSet<Hash256> = seed.clone();
        let mut frontier: Vec<Hash256> = seed.iter().copied().collect();
        while let Some(next) = frontier.pop() {
            if let Some(entry) = self.entries.get(&next) {
                for linked in link(entry) {
                    if closure.insert(*linked) {
                        frontier.push(*linked);
                    }
                }
            }
        }
        closure
    }

    /// Iterate entries by ancestor fee rate, best package first.
    ///
    /// The order is deterministic: ties in rate break by ascending txid.
    pub fn ancestor_score_iter(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.by_ancestor_score
            .iter()
            .filter_map(move |score| self.entries.get(&score.txid))
    }

    /// Get a mempool entry by txid.
    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Check if a transaction with the given txid is in the pool.
    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    /// Number of transactions in the pool.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all entries (arbitrary order).
    pub fn iter(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    /// Remove transactions confirmed in a block, evict conflicting spends,
    /// and refresh the ancestor state of everything left behind.
    ///
    /// Call this when a new block is connected. Descendants of a confirmed
    /// transaction stay (their inputs are now confirmed) with recomputed
    /// aggregates; descendants of an evicted conflict are evicted with it.
    pub fn remove_confirmed(&mut self, block: &Block) {
        let mut confirmed: HashSet<Hash256> = HashSet::new();
        for tx in &block.transactions {
            if let Ok(txid) = tx.txid() {
                if self.entries.contains_key(&txid) {
                    confirmed.insert(txid);
                }
            }
        }

        // Pool transactions that spend an outpoint the block just spent, but
        // were not themselves confirmed, are dead along with their
        // descendants.
        let mut evicted: HashSet<Hash256> = HashSet::new();
        for tx in &block.transactions {
            for input in &tx.inputs {
                if input.previous_output.is_null() {
                    continue;
                }
                if let Some(spender) = self.by_outpoint.get(&input.previous_output) {
                    if !confirmed.contains(spender) {
                        evicted.extend(self.calculate_descendants(spender));
                    }
                }
            }
        }

        // Collect survivors whose ancestor state will be stale, before any
        // links are dropped.
        let removed: HashSet<Hash256> = confirmed.union(&evicted).copied().collect();
        let mut stale: HashSet<Hash256> = HashSet::new();
        for txid in &removed {
            for descendant in self.calculate_descendants(txid) {
                if !removed.contains(&descendant) {
                    stale.insert(descendant);
                }
            }
        }

        for txid in &removed {
            self.remove_entry(txid);
        }
        for txid in &stale {
            self.recompute_ancestor_state(txid);
        }

        debug!(
            confirmed = confirmed.len(),
            evicted = evicted.len(),
            refreshed = stale.len(),
            "updated mempool for connected block"
        );
    }

    /// Remove an entry and clean up all indices and graph links.
    fn remove_entry(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.by_ancestor_score.remove(&entry.score());
        for input in &entry.tx.inputs {
            self.by_outpoint.remove(&input.previous_output);
        }
        for parent in &entry.parents {
            if let Some(parent_entry) = self.entries.get_mut(parent) {
                parent_entry.children.remove(txid);
            }
        }
        for child in &entry.children {
            if let Some(child_entry) = self.entries.get_mut(child) {
                child_entry.parents.remove(txid);
            }
        }
        Some(entry)
    }

    /// Recompute an entry's ancestor aggregates from the current graph.
    fn recompute_ancestor_state(&mut self, txid: &Hash256) {
        let ancestors = self.calculate_ancestors(txid);

        let Some(entry) = self.entries.get(txid) else { return };
        let mut count = 1u64;
        let mut size = entry.vsize;
        let mut fees = entry.modified_fee;
        let mut sigops = entry.sigop_cost;
        for ancestor in &ancestors {
            if let Some(anc) = self.entries.get(ancestor) {
                count += 1;
                size += anc.vsize;
                fees += anc.modified_fee;
                sigops += anc.sigop_cost;
            }
        }

        if let Some(entry) = self.entries.get_mut(txid) {
            self.by_ancestor_score.remove(&entry.score());
            entry.count_with_ancestors = count;
            entry.size_with_ancestors = size;
            entry.fees_with_ancestors = fees;
            entry.sigops_with_ancestors = sigops;
            self.by_ancestor_score.insert(entry.score());
        }
    }
}
