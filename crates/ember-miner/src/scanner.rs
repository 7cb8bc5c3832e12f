//! Nonce scanning: sweep a bounded slice of the 32-bit nonce space against a
//! difficulty target.
//!
//! The scanner serializes the header once and patches the nonce bytes in
//! place per attempt. A hash can only satisfy the target if its bytes at or
//! above the target's leading-zero boundary are all zero, so most attempts
//! are rejected on that prefix without a full 256-bit comparison; survivors
//! get the full comparison, so every reported solution satisfies
//! `hash <= target`.
//!
//! Each call gives up after a bounded number of attempts so the caller can
//! observe cancellation, tip changes, and clock movement with sub-second
//! latency even on slow hash functions.

use ember_core::pow::{PowHasher, Target};
use ember_core::types::{BlockHeader, Hash256};

/// The scanner returns to the caller whenever the incremented nonce crosses
/// this boundary.
const SCAN_BATCH_MASK: u32 = 0xfff;

/// Result of one scanner call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A nonce whose hash satisfies the target.
    Found {
        /// The solving nonce. The caller's mutable nonce is left one past it.
        nonce: u32,
        /// The proof-of-work hash at that nonce.
        hash: Hash256,
    },
    /// The attempt budget ran out; call again to continue from the current
    /// nonce after re-checking staleness conditions.
    Exhausted,
}

/// Scan nonces from `*nonce` until a solution is found or the batch budget
/// runs out, incrementing `hashes_scanned` per attempt.
///
/// The nonce wraps at `u32::MAX`; the caller owns restart policy. A target
/// whose top byte is non-zero is trivially easy: the first nonce tried is
/// reported without filtering, and the caller's own comparison governs.
pub fn scan_pow_hash(
    hasher: &dyn PowHasher,
    header: &BlockHeader,
    nonce: &mut u32,
    target: &Target,
    hashes_scanned: &mut u64,
) -> ScanOutcome {
    let first_zero = target.first_leading_zero_byte();
    let mut bytes = header.serialize();

    if first_zero == 32 {
        // Nothing to look for.
        bytes[76..80].copy_from_slice(&nonce.to_le_bytes());
        let hash = hasher.pow_hash(&bytes);
        *hashes_scanned += 1;
        let tried = *nonce;
        *nonce = nonce.wrapping_add(1);
        return ScanOutcome::Found { nonce: tried, hash };
    }

    loop {
        bytes[76..80].copy_from_slice(&nonce.to_le_bytes());
        let hash = hasher.pow_hash(&bytes);
        *hashes_scanned += 1;
        let tried = *nonce;
        *nonce = nonce.wrapping_add(1);

        if hash.0[first_zero..].iter().all(|&b| b == 0) && target.is_met_by(&hash) {
            return ScanOutcome::Found { nonce: tried, hash };
        }

        if *nonce & SCAN_BATCH_MASK == 0 {
            return ScanOutcome::Exhausted;
        }
    }
}
