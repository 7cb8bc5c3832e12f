//! Fee rates and exact package-rate comparisons.
//!
//! All ordering decisions in block assembly compare `(fee, size)` pairs by
//! cross-multiplication in 128-bit integers. Collapsing a package to a scalar
//! rate would round, and rounding changes which package wins.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::types::Hash256;

/// A fee rate in embers per 1000 virtual bytes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FeeRate {
    per_kvb: u64,
}

impl FeeRate {
    /// A zero fee rate (no floor).
    pub const ZERO: Self = Self { per_kvb: 0 };

    /// Construct from embers per 1000 virtual bytes.
    pub const fn from_per_kvb(per_kvb: u64) -> Self {
        Self { per_kvb }
    }

    /// The rate paid by `fee` embers over `vsize` virtual bytes, rounded down.
    pub fn from_fee(fee: u64, vsize: u64) -> Self {
        if vsize == 0 {
            return Self { per_kvb: u64::MAX };
        }
        let rate = (fee as u128) * 1000 / (vsize as u128);
        Self {
            per_kvb: rate.min(u64::MAX as u128) as u64,
        }
    }

    /// Embers per 1000 virtual bytes.
    pub fn per_kvb(&self) -> u64 {
        self.per_kvb
    }

    /// The fee this rate charges for `vsize` virtual bytes, rounded down.
    pub fn fee_for(&self, vsize: u64) -> u64 {
        let fee = (self.per_kvb as u128) * (vsize as u128) / 1000;
        fee.min(u64::MAX as u128) as u64
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ember/kvB", self.per_kvb)
    }
}

/// Compare two packages by fee rate without dividing: `fee_a/size_a` vs
/// `fee_b/size_b` as `fee_a * size_b` vs `fee_b * size_a`.
///
/// Fees are signed because prioritisation deltas can push a modified fee
/// below zero. Zero sizes compare as infinitely dense.
pub fn package_rate_cmp(fee_a: i64, size_a: u64, fee_b: i64, size_b: u64) -> Ordering {
    match (size_a, size_b) {
        (0, 0) => Ordering::Equal,
        (0, _) => Ordering::Greater,
        (_, 0) => Ordering::Less,
        _ => {
            let lhs = (fee_a as i128) * (size_b as i128);
            let rhs = (fee_b as i128) * (size_a as i128);
            lhs.cmp(&rhs)
        }
    }
}

/// Ordering key for package selection: ancestor fee rate descending, ties
/// broken by ascending txid so templates are reproducible.
///
/// `Ord` is inverted on the rate so that ascending iteration over a
/// `BTreeSet<PackageScore>` visits the best package first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackageScore {
    /// Package fees (modified, with ancestors).
    pub fees: i64,
    /// Package virtual size (with ancestors).
    pub size: u64,
    /// Entry transaction ID, the deterministic tie-break.
    pub txid: Hash256,
}

impl Ord for PackageScore {
    fn cmp(&self, other: &Self) -> Ordering {
        match package_rate_cmp(self.fees, self.size, other.fees, other.size) {
            Ordering::Greater => Ordering::Less,
            Ordering::Less => Ordering::Greater,
            Ordering::Equal => self
                .txid
                .cmp(&other.txid)
                .then_with(|| self.fees.cmp(&other.fees))
                .then_with(|| self.size.cmp(&other.size)),
        }
    }
}

impl PartialOrd for PackageScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
