//! Protocol constants. All monetary values in embers (1 EMBER = 10^8 embers).

pub const COIN: u64 = 100_000_000;

/// Weight multiplier applied to non-witness (stripped) transaction bytes.
pub const WITNESS_SCALE_FACTOR: u64 = 4;

/// Consensus cap on total block weight.
pub const MAX_BLOCK_WEIGHT: u64 = 4_000_000;

/// Consensus cap on total signature-operation cost per block.
pub const MAX_BLOCK_SIGOPS_COST: i64 = 80_000;

/// Weight units the assembler reserves up front for the coinbase transaction.
pub const COINBASE_WEIGHT_RESERVE: u64 = 4_000;

/// Sigop cost the assembler reserves up front for the coinbase transaction.
pub const COINBASE_SIGOPS_RESERVE: i64 = 400;

/// Default block weight target when no `block_max_weight` is configured.
pub const DEFAULT_BLOCK_MAX_WEIGHT: u64 = MAX_BLOCK_WEIGHT - COINBASE_WEIGHT_RESERVE;

/// Default minimum package fee rate, in embers per 1000 virtual bytes.
pub const DEFAULT_BLOCK_MIN_TX_FEE: u64 = 1_000;

/// Consensus cap on the coinbase scriptSig length in bytes.
pub const MAX_COINBASE_SCRIPT_SIG_SIZE: usize = 100;

/// Lock-time values below this threshold are block heights; at or above it
/// they are unix timestamps.
pub const LOCKTIME_THRESHOLD: u64 = 500_000_000;

/// Serialized block header size in bytes (the proof-of-work preimage).
pub const HEADER_SIZE: usize = 80;

/// Network type: Mainnet, Testnet, or Regtest.
///
/// Controls the proof-of-work policy quirks the miner has to care about:
/// whether min-difficulty blocks are allowed (changing the header time can
/// change the required work) and whether blocks are mined on demand.
///
/// # Examples
///
/// ```
/// use ember_core::constants::NetworkType;
/// let net = NetworkType::default();
/// assert_eq!(net, NetworkType::Mainnet);
/// assert!(!net.allow_min_difficulty_blocks());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetworkType {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network; permits min-difficulty blocks after a timeout.
    Testnet,
    /// Local regression-test network; blocks are mined on demand.
    Regtest,
}

impl NetworkType {
    /// Whether this network permits min-difficulty blocks.
    ///
    /// On such networks the required work is a function of the header time,
    /// so the miner must recompute its target whenever it bumps the clock.
    pub fn allow_min_difficulty_blocks(&self) -> bool {
        matches!(self, Self::Testnet | Self::Regtest)
    }

    /// Whether blocks are produced on demand rather than continuously.
    ///
    /// On regtest a worker stops after its first accepted block, and the
    /// configured `block_version_override` is honored.
    pub fn mine_blocks_on_demand(&self) -> bool {
        matches!(self, Self::Regtest)
    }
}
