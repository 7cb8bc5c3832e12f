//! Core protocol types: transactions, blocks, headers, templates.
//!
//! All monetary values are in embers (1 EMBER = 10^8 embers). Transaction IDs
//! are BLAKE3 over the canonical (witness-stripped) bincode encoding; the
//! proof-of-work hash is computed over the exact 80-byte header layout.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::constants::{HEADER_SIZE, LOCKTIME_THRESHOLD, WITNESS_SCALE_FACTOR};
use crate::error::TxError;

/// A 32-byte hash value.
///
/// Used for transaction IDs, merkle roots, and proof-of-work hashes.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Used for coinbase previous outpoints.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u32,
}

impl OutPoint {
    /// The null outpoint, used for coinbase transaction inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u32::MAX,
        }
    }

    /// Check if this is the null outpoint (coinbase marker).
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The outpoint being spent. Null outpoint for coinbase.
    pub previous_output: OutPoint,
    /// Unlocking script. Carries the height and extra-nonce pushes for coinbase.
    pub script_sig: Vec<u8>,
    /// Sequence number. `u32::MAX` disables lock-time for this input.
    pub sequence: u32,
}

/// A transaction output, creating a new spendable coin.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in embers.
    pub value: u64,
    /// Locking script.
    pub script_pubkey: Vec<u8>,
}

/// Per-input witness stack.
pub type WitnessStack = Vec<Vec<u8>>;

/// A transaction transferring value between scripts.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Protocol version.
    pub version: i32,
    /// Inputs consuming previous outputs.
    pub inputs: Vec<TxInput>,
    /// New outputs created by this transaction.
    pub outputs: Vec<TxOutput>,
    /// Witness stacks, one per input. Empty when the tx carries no witness.
    pub witness: Vec<WitnessStack>,
    /// Block height or timestamp before which this tx is invalid.
    pub lock_time: u32,
}

impl Transaction {
    /// Compute the transaction ID: BLAKE3 of the witness-stripped canonical
    /// encoding, so malleating the witness cannot change the txid.
    pub fn txid(&self) -> Result<Hash256, TxError> {
        let encoded = encode(&self.stripped())?;
        Ok(Hash256(blake3::hash(&encoded).into()))
    }

    /// Check if this is a coinbase transaction (single input with null outpoint).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Whether any input carries witness data.
    pub fn has_witness(&self) -> bool {
        self.witness.iter().any(|stack| !stack.is_empty())
    }

    /// A copy of this transaction with all witness data removed.
    pub fn stripped(&self) -> Self {
        Self {
            witness: Vec::new(),
            ..self.clone()
        }
    }

    /// Serialized size in bytes, witness included.
    pub fn total_size(&self) -> Result<u64, TxError> {
        Ok(encode(self)?.len() as u64)
    }

    /// Serialized size in bytes with witness data removed.
    pub fn stripped_size(&self) -> Result<u64, TxError> {
        Ok(encode(&self.stripped())?.len() as u64)
    }

    /// Consensus weight: `3 * stripped_size + total_size`.
    ///
    /// Equivalent to counting non-witness bytes four times and witness bytes
    /// once.
    pub fn weight(&self) -> Result<u64, TxError> {
        Ok((WITNESS_SCALE_FACTOR - 1) * self.stripped_size()? + self.total_size()?)
    }

    /// Virtual size: weight rounded up to whole weight-scale units.
    pub fn vsize(&self) -> Result<u64, TxError> {
        Ok(self.weight()?.div_ceil(WITNESS_SCALE_FACTOR))
    }

    /// Whether the transaction is final at the given height and lock-time
    /// cutoff.
    ///
    /// A lock_time of zero is always final. Values below the lock-time
    /// threshold are compared against the block height, values at or above it
    /// against the cutoff timestamp. A non-final lock_time is overridden when
    /// every input opts out via a `u32::MAX` sequence.
    pub fn is_final(&self, height: u64, lock_time_cutoff: u64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let bound = if u64::from(self.lock_time) < LOCKTIME_THRESHOLD {
            height
        } else {
            lock_time_cutoff
        };
        if u64::from(self.lock_time) < bound {
            return true;
        }
        self.inputs.iter().all(|input| input.sequence == u32::MAX)
    }

    /// Legacy sigop count over all input and output scripts, unscaled.
    pub fn legacy_sigop_count(&self) -> i64 {
        let inputs: i64 = self
            .inputs
            .iter()
            .map(|i| crate::script::legacy_sigop_count(&i.script_sig))
            .sum();
        let outputs: i64 = self
            .outputs
            .iter()
            .map(|o| crate::script::legacy_sigop_count(&o.script_pubkey))
            .sum();
        inputs + outputs
    }
}

/// Encode a value with the canonical bincode configuration.
fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, TxError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| TxError::Serialization(e.to_string()))
}

/// Block header containing the proof-of-work puzzle.
///
/// Serializes to exactly 80 bytes; that byte string is the PoW preimage.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Block version, from soft-fork signalling.
    pub version: i32,
    /// Hash of the previous block header.
    pub prev_hash: Hash256,
    /// Merkle root of the block's transaction IDs.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub time: u32,
    /// Compact encoding of the difficulty target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

impl BlockHeader {
    /// Canonical 80-byte serialization: version, prev hash, merkle root,
    /// time, bits, nonce; integers little-endian, hashes as stored.
    ///
    /// The nonce occupies bytes 76..80 so the scanner can patch it in place.
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prev_hash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }
}

/// A complete block: header plus transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    /// Block header with proof-of-work.
    pub header: BlockHeader,
    /// Ordered list of transactions. First transaction must be coinbase.
    pub transactions: Vec<Arc<Transaction>>,
}

impl Block {
    /// Get the coinbase transaction, if the block is non-empty.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().map(Arc::as_ref)
    }

    /// Total consensus weight of the block's transactions.
    pub fn weight(&self) -> Result<u64, TxError> {
        self.transactions.iter().try_fold(0u64, |acc, tx| Ok(acc + tx.weight()?))
    }
}

/// A candidate block produced by the assembler, with per-transaction fee and
/// sigop-cost bookkeeping.
///
/// Index 0 of every sequence is the coinbase slot. `fees[0]` carries the
/// negated sum of all other fees, so the coinbase entry doubles as a record
/// of the fees it collects.
#[derive(Clone, Debug)]
pub struct BlockTemplate {
    /// The assembled candidate block.
    pub block: Block,
    /// Per-transaction fees; `fees[0] == -(fees[1..].sum())`.
    pub fees: Vec<i64>,
    /// Per-transaction sigop costs, weight-scaled for the coinbase slot.
    pub sigop_costs: Vec<i64>,
    /// Witness commitment produced by the consensus collaborator.
    pub coinbase_commitment: Vec<u8>,
}
