//! Miner thread-group lifecycle: spawn N workers, cancel cooperatively,
//! join cleanly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::worker::{run_worker, MinerHandles};

/// Shared cooperative-cancellation flag.
///
/// Workers observe it between scanner calls and inside interruptible sleeps;
/// nothing is ever terminated forcibly.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every holder of this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on cancellation.
    ///
    /// Returns `false` if cancellation was observed, `true` if the full
    /// duration elapsed.
    pub fn sleep_interruptible(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return true;
            };
            thread::sleep(remaining.min(Duration::from_millis(100)));
            if Instant::now() >= deadline {
                return !self.is_cancelled();
            }
        }
    }
}

/// The miner supervisor: owns the worker thread group.
pub struct Miner {
    handles: MinerHandles,
    workers: Vec<JoinHandle<()>>,
    cancel: CancelToken,
}

impl Miner {
    /// Create a supervisor over the given collaborator handles. No threads
    /// are started until [`generate_coins`](Self::generate_coins).
    pub fn new(handles: MinerHandles) -> Self {
        Self {
            handles,
            workers: Vec::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Start or stop mining.
    ///
    /// Any running workers are cancelled and joined before the state
    /// changes. When `enable` is true and `n_threads > 0`, that many worker
    /// threads are spawned, each tagged `'1' + i` for log attribution.
    pub fn generate_coins(&mut self, enable: bool, n_threads: usize) {
        if !self.workers.is_empty() {
            self.cancel.cancel();
            for handle in self.workers.drain(..) {
                if handle.join().is_err() {
                    error!("miner worker panicked");
                }
            }
        }

        if !enable || n_threads == 0 {
            return;
        }

        info!(threads = n_threads, "starting miner workers");
        self.cancel = CancelToken::new();
        for i in 0..n_threads {
            let tag = char::from(b'1'.wrapping_add(i as u8));
            let handles = self.handles.clone();
            let cancel = self.cancel.clone();
            let spawned = thread::Builder::new()
                .name(format!("ember-miner-{tag}"))
                .spawn(move || run_worker(&handles, tag, &cancel));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(err) => error!(%err, "failed to spawn miner worker"),
            }
        }
    }

    /// Number of live mining workers (0 when not running).
    pub fn how_many_mining_threads(&self) -> usize {
        self.workers.iter().filter(|handle| !handle.is_finished()).count()
    }

    /// The token workers of the current generation observe.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

impl Drop for Miner {
    fn drop(&mut self) {
        self.generate_coins(false, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::AssemblerOptions;
    use crate::testutil::{CollectSink, FixedClock, MockChain, MockNetwork, MockWallet, shared_pool};
    use ember_core::constants::NetworkType;
    use ember_core::pow::Sha256dHasher;
    use ember_core::traits::{BlockSink, ChainView, MiningWallet, NetworkInfo};

    const EASY_BITS: u32 = 0x207f_ffff;
    /// A target requiring 31 zero bytes: never solved, keeps workers busy.
    const IMPOSSIBLE_BITS: u32 = 0x0100_0000;

    fn handles(network_type: NetworkType, bits: u32, network: &Arc<MockNetwork>) -> MinerHandles {
        MinerHandles {
            network_type,
            options: AssemblerOptions::default(),
            chain: Arc::new(MockChain::new(bits)) as Arc<dyn ChainView>,
            mempool: shared_pool(),
            network: Arc::clone(network) as Arc<dyn NetworkInfo>,
            wallet: Arc::new(MockWallet::with_script()) as Arc<dyn MiningWallet>,
            sink: Arc::new(CollectSink::accepting()) as Arc<dyn BlockSink>,
            clock: Arc::new(FixedClock::at(1_700_000_600)),
            hasher: Arc::new(Sha256dHasher),
        }
    }

    // --- CancelToken ---

    #[test]
    fn token_starts_clear_and_latches() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        // Clones observe the same flag.
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn interruptible_sleep_completes_when_not_cancelled() {
        let token = CancelToken::new();
        let started = Instant::now();
        assert!(token.sleep_interruptible(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn interruptible_sleep_wakes_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });

        let started = Instant::now();
        assert!(!token.sleep_interruptible(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(2));
        waker.join().unwrap();
    }

    #[test]
    fn sleep_on_cancelled_token_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        let started = Instant::now();
        assert!(!token.sleep_interruptible(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    // --- Miner ---

    #[test]
    fn idle_miner_reports_zero_threads() {
        let network = Arc::new(MockNetwork::online());
        let miner = Miner::new(handles(NetworkType::Mainnet, EASY_BITS, &network));
        assert_eq!(miner.how_many_mining_threads(), 0);
    }

    #[test]
    fn generate_coins_spawns_and_stops_workers() {
        let network = Arc::new(MockNetwork::online());
        let mut miner = Miner::new(handles(NetworkType::Mainnet, IMPOSSIBLE_BITS, &network));

        miner.generate_coins(true, 3);
        // Workers are grinding on an unsolvable target.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(miner.how_many_mining_threads(), 3);

        miner.generate_coins(false, 0);
        assert_eq!(miner.how_many_mining_threads(), 0);
    }

    #[test]
    fn restarting_replaces_the_worker_group() {
        let network = Arc::new(MockNetwork::online());
        let mut miner = Miner::new(handles(NetworkType::Mainnet, IMPOSSIBLE_BITS, &network));

        miner.generate_coins(true, 2);
        thread::sleep(Duration::from_millis(50));
        let first_token = miner.cancel_token();

        miner.generate_coins(true, 4);
        // The old generation was cancelled and joined before the new spawn.
        assert!(first_token.is_cancelled());
        thread::sleep(Duration::from_millis(100));
        assert_eq!(miner.how_many_mining_threads(), 4);

        miner.generate_coins(false, 0);
        assert_eq!(miner.how_many_mining_threads(), 0);
    }

    #[test]
    fn cancellation_latency_is_bounded() {
        let network = Arc::new(MockNetwork::online());
        let mut miner = Miner::new(handles(NetworkType::Mainnet, IMPOSSIBLE_BITS, &network));
        miner.generate_coins(true, 2);
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        miner.generate_coins(false, 0);
        // Signal-to-joined under two seconds.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(miner.how_many_mining_threads(), 0);
    }

    #[test]
    fn workers_that_exit_on_their_own_stop_counting() {
        let network = Arc::new(MockNetwork::online());
        let mut base = handles(NetworkType::Mainnet, EASY_BITS, &network);
        base.wallet = Arc::new(MockWallet::empty()) as Arc<dyn MiningWallet>;
        let mut miner = Miner::new(base);

        // Workers log the missing coinbase script and exit immediately.
        miner.generate_coins(true, 2);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(miner.how_many_mining_threads(), 0);
    }

    #[test]
    fn drop_joins_workers() {
        let network = Arc::new(MockNetwork::online());
        let sink = Arc::new(CollectSink::accepting());
        let mut base = handles(NetworkType::Mainnet, IMPOSSIBLE_BITS, &network);
        base.sink = Arc::clone(&sink) as Arc<dyn BlockSink>;

        let started = Instant::now();
        {
            let mut miner = Miner::new(base);
            miner.generate_coins(true, 2);
            thread::sleep(Duration::from_millis(50));
        }
        // Drop cancelled and joined; no blocks were submitted on the
        // unsolvable target.
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(sink.blocks.lock().is_empty());
    }
}
