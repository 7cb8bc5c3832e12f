//! The per-thread mining loop: build a template, sweep the nonce space,
//! submit solutions, rebuild when the world changes.
//!
//! A worker owns no shared mutable state. Everything it touches arrives via
//! [`MinerHandles`], and neither the chain-state nor the mempool lock is held
//! across the scan loop — the assembler takes and releases them per template.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use tracing::{error, info, warn};

use ember_core::constants::NetworkType;
use ember_core::pow::{PowHasher, Target};
use ember_core::traits::{BlockSink, ChainView, Clock, MiningWallet, NetworkInfo};
use ember_core::types::{Block, Hash256};
use ember_mempool::Mempool;

use crate::assembler::{increment_extra_nonce, update_time, AssemblerOptions, BlockAssembler};
use crate::scanner::{scan_pow_hash, ScanOutcome};
use crate::supervisor::CancelToken;

/// Everything a mining worker needs, bundled for cheap cloning into threads.
#[derive(Clone)]
pub struct MinerHandles {
    pub network_type: NetworkType,
    pub options: AssemblerOptions,
    pub chain: Arc<dyn ChainView>,
    pub mempool: Arc<RwLock<Mempool>>,
    pub network: Arc<dyn NetworkInfo>,
    pub wallet: Arc<dyn MiningWallet>,
    pub sink: Arc<dyn BlockSink>,
    pub clock: Arc<dyn Clock>,
    pub hasher: Arc<dyn PowHasher>,
}

/// Why the scan loop ended.
enum ScanEnd {
    /// Build a fresh template and keep mining.
    Rebuild,
    /// Leave the worker entirely.
    Stop,
}

/// Run one mining worker until cancellation, a fatal error, or (on demand
/// networks) the first accepted block.
///
/// `tag` is a single character identifying the worker in logs.
pub fn run_worker(handles: &MinerHandles, tag: char, cancel: &CancelToken) {
    info!(worker = %tag, "miner worker started");

    // A missing or empty script means the keypool is exhausted; there is
    // nothing to retry until the operator intervenes.
    let coinbase_script = match handles.wallet.script_for_mining() {
        Some(script) if !script.is_empty() => script,
        _ => {
            warn!(worker = %tag, "no coinbase script available (mining requires a wallet)");
            return;
        }
    };

    let assembler = BlockAssembler::new(
        handles.network_type,
        Arc::clone(&handles.chain),
        Arc::clone(&handles.mempool),
        Arc::clone(&handles.clock),
        handles.options.clone(),
    );

    let mut rng = rand::thread_rng();
    let worker_started = Instant::now();
    let mut hashes_by_worker: u64 = 0;
    let mut extra_nonce: u32 = 0;
    let mut last_prev_hash = Hash256::ZERO;

    loop {
        // Readiness gate: mining with no peers or mid-sync would extend a
        // stale chain.
        while handles.network.peer_count() == 0 || handles.network.is_initial_block_download() {
            if !cancel.sleep_interruptible(Duration::from_secs(1)) {
                info!(worker = %tag, "miner worker interrupted");
                return;
            }
        }
        if cancel.is_cancelled() {
            break;
        }

        let tip = handles.chain.tip();
        let mut template = match assembler.create_new_block(&coinbase_script, true) {
            Ok(template) => template,
            Err(err) => {
                // Configuration and assembly-invariant errors must not be
                // retried in a loop.
                error!(worker = %tag, %err, "failed to assemble block template");
                return;
            }
        };
        if let Err(err) =
            increment_extra_nonce(&mut template.block, &tip, &mut last_prev_hash, &mut extra_nonce)
        {
            error!(worker = %tag, %err, "failed to refresh coinbase extra nonce");
            return;
        }

        let Some(mut target) = Target::from_compact(template.block.header.bits) else {
            error!(
                worker = %tag,
                bits = format_args!("{:#010x}", template.block.header.bits),
                "chain produced unusable difficulty bits"
            );
            return;
        };

        let mut nonce: u32 = rng.gen();
        let mut hashes_scanned: u64 = 0;
        let scan_started = Instant::now();

        info!(
            worker = %tag,
            txs = template.block.transactions.len(),
            target = %target,
            start_nonce = format_args!("{nonce:#010x}"),
            "scanning for proof of work"
        );

        let end = loop {
            if let ScanOutcome::Found { nonce: found, hash } = scan_pow_hash(
                handles.hasher.as_ref(),
                &template.block.header,
                &mut nonce,
                &target,
                &mut hashes_scanned,
            ) {
                template.block.header.nonce = found;
                let canonical = handles.hasher.pow_hash(&template.block.header.serialize());
                if canonical != hash {
                    error!(
                        worker = %tag,
                        scanner = %hash,
                        canonical = %canonical,
                        "scanner hash disagrees with the canonical path"
                    );
                    break ScanEnd::Stop;
                }
                if target.is_met_by(&hash) {
                    info!(
                        worker = %tag,
                        nonce = format_args!("{found:#010x}"),
                        %hash,
                        %target,
                        "proof of work found"
                    );
                    if process_block_found(handles, &template.block) {
                        handles.wallet.keep_script();
                        if handles.network_type.mine_blocks_on_demand() {
                            // Demand networks mine one block per request.
                            break ScanEnd::Stop;
                        }
                    }
                    break ScanEnd::Rebuild;
                }
                // A candidate passed the zero-byte filter but missed the
                // target; jump to a fresh region of the nonce space.
                nonce = rng.gen();
            }

            if cancel.is_cancelled() {
                break ScanEnd::Stop;
            }
            if handles.chain.tip().hash != tip.hash {
                break ScanEnd::Rebuild;
            }
            // Rebuild if the clock ran backwards, to pick up the actual time.
            if update_time(
                &mut template.block.header,
                handles.network_type,
                handles.chain.as_ref(),
                handles.clock.as_ref(),
                &tip,
            ) < 0
            {
                break ScanEnd::Rebuild;
            }
            if handles.network_type.allow_min_difficulty_blocks() {
                // Changing the header time can change the required work.
                if let Some(updated) = Target::from_compact(template.block.header.bits) {
                    target = updated;
                }
            }
        };

        hashes_by_worker += hashes_scanned;
        let block_rate = hashes_scanned as f64 / scan_started.elapsed().as_secs_f64().max(1e-9);
        let overall_rate =
            hashes_by_worker as f64 / worker_started.elapsed().as_secs_f64().max(1e-9);
        info!(
            worker = %tag,
            hashes = hashes_scanned,
            block_rate = format_args!("{block_rate:.0} H/s"),
            total_hashes = hashes_by_worker,
            overall_rate = format_args!("{overall_rate:.0} H/s"),
            "scan finished"
        );

        match end {
            ScanEnd::Rebuild => continue,
            ScanEnd::Stop => break,
        }
    }

    info!(worker = %tag, "miner worker stopped");
}

/// Hand a solved block to the processing pipeline, unless the chain moved
/// underneath us while we were scanning.
fn process_block_found(handles: &MinerHandles, block: &Block) -> bool {
    let reward = block
        .coinbase()
        .and_then(|coinbase| coinbase.outputs.first())
        .map(|output| output.value)
        .unwrap_or(0);
    info!(
        txs = block.transactions.len(),
        generated = reward,
        "new block generated"
    );

    let tip = handles.chain.tip();
    if block.header.prev_hash != tip.hash {
        warn!("generated block is stale, discarding");
        return false;
    }

    if !handles.sink.process_new_block(block, true) {
        warn!("generated block was not accepted");
        return false;
    }
    true
}
