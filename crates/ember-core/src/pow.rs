//! Proof-of-work primitives: the 256-bit target, the compact-bits codec, and
//! the header hash behind the [`PowHasher`] trait.
//!
//! The production hash is scrypt (N=1024, r=1, p=1) over the 80-byte header,
//! using the header as both password and salt. The hasher is a trait so the
//! algorithm stays a collaborator parameter; a double-SHA-256 implementation
//! ships alongside for cheap tests and benchmarks.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::constants::HEADER_SIZE;
use crate::types::{BlockHeader, Hash256};

/// A 256-bit proof-of-work threshold, stored little-endian (the most
/// significant byte is index 31).
///
/// A block is valid iff its PoW hash, read as a little-endian 256-bit
/// integer, is less than or equal to the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Target(pub [u8; 32]);

impl Target {
    /// Decode a compact-bits difficulty encoding.
    ///
    /// The compact form is `0xEEMMMMMM`: an 8-bit exponent and a 23-bit
    /// mantissa (bit 23 is the sign). Returns `None` for negative or
    /// overflowing encodings, which can never be met.
    pub fn from_compact(bits: u32) -> Option<Self> {
        let exponent = (bits >> 24) as usize;
        let mantissa = bits & 0x007f_ffff;
        if bits & 0x0080_0000 != 0 && mantissa != 0 {
            return None;
        }
        // Overflow: the mantissa would shift past the top of 256 bits.
        if (mantissa > 0xff && exponent > 33)
            || (mantissa > 0xffff && exponent > 32)
            || exponent > 34
        {
            return None;
        }

        let mut bytes = [0u8; 32];
        if exponent <= 3 {
            let shifted = mantissa >> (8 * (3 - exponent));
            bytes[..4].copy_from_slice(&shifted.to_le_bytes());
        } else {
            let le = mantissa.to_le_bytes();
            let offset = exponent - 3;
            for (i, byte) in le[..3].iter().enumerate() {
                if offset + i < 32 {
                    bytes[offset + i] = *byte;
                }
            }
        }
        Some(Self(bytes))
    }

    /// Whether the given hash satisfies this target (`hash <= target` as
    /// little-endian 256-bit integers).
    pub fn is_met_by(&self, hash: &Hash256) -> bool {
        for i in (0..32).rev() {
            if hash.0[i] != self.0[i] {
                return hash.0[i] < self.0[i];
            }
        }
        true
    }

    /// Index of the lowest byte such that every byte at or above it is zero.
    ///
    /// A hash can only satisfy the target if its bytes at or above this index
    /// are all zero, which gives the scanner a cheap rejection test. Returns
    /// 32 when the top byte is non-zero (every hash is a candidate) and never
    /// less than 1.
    pub fn first_leading_zero_byte(&self) -> usize {
        let mut i = 32;
        while i > 1 {
            if self.0[i - 1] != 0 {
                break;
            }
            i -= 1;
        }
        i
    }

    /// Whether the target is zero (unmeetable in practice).
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Target {
    /// Big-endian hex, the conventional reading order for targets.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().rev() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// The header hash function, as a collaborator parameter.
///
/// Implementations must be pure, deterministic, and thread-safe: the same
/// 80 bytes always produce the same digest, on any thread.
pub trait PowHasher: Send + Sync {
    /// Hash the canonical 80-byte header serialization.
    fn pow_hash(&self, header: &[u8; HEADER_SIZE]) -> Hash256;
}

/// Production proof-of-work hash: scrypt with N=1024, r=1, p=1, 256-bit
/// output, using the header bytes as both password and salt.
pub struct ScryptHasher {
    params: scrypt::Params,
}

impl ScryptHasher {
    /// Create a hasher with the chain's fixed scrypt parameters.
    pub fn new() -> Self {
        Self {
            // log2(1024) = 10.
            params: scrypt::Params::new(10, 1, 1, 32).expect("valid scrypt parameters"),
        }
    }
}

impl Default for ScryptHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl PowHasher for ScryptHasher {
    fn pow_hash(&self, header: &[u8; HEADER_SIZE]) -> Hash256 {
        let mut out = [0u8; 32];
        scrypt::scrypt(header, header, &self.params, &mut out)
            .expect("32-byte output length is valid");
        Hash256(out)
    }
}

/// Double SHA-256 header hash. Orders of magnitude faster than scrypt; used
/// by tests and benchmarks, and available to chains that prefer it.
#[derive(Default)]
pub struct Sha256dHasher;

impl PowHasher for Sha256dHasher {
    fn pow_hash(&self, header: &[u8; HEADER_SIZE]) -> Hash256 {
        let first = Sha256::digest(header);
        Hash256(Sha256::digest(first).into())
    }
}

/// Check a header's proof of work against its own compact bits.
///
/// This is the canonical path: decode the target, hash the canonical
/// serialization, compare. The scanner's early-out must agree with this for
/// every solution it reports.
pub fn check_proof_of_work(header: &BlockHeader, hasher: &dyn PowHasher) -> bool {
    let Some(target) = Target::from_compact(header.bits) else {
        return false;
    };
    if target.is_zero() {
        return false;
    }
    target.is_met_by(&hasher.pow_hash(&header.serialize()))
}
