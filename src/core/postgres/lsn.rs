// src/core/postgres/lsn.rs

//! The Postgres Log Sequence Number: a monotone 64-bit WAL position,
//! rendered as `XXXXXXXX/XXXXXXXX` on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A WAL position. `Lsn(0)` is the invalid sentinel (`0/0`), used when the
/// local Postgres cannot be probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Bytes between two positions, saturating at zero when `other` is ahead.
    pub fn distance_from(&self, other: Lsn) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid lsn '{s}': missing '/'"))?;
        let hi = u64::from_str_radix(hi, 16).map_err(|e| format!("invalid lsn '{s}': {e}"))?;
        let lo = u64::from_str_radix(lo, 16).map_err(|e| format!("invalid lsn '{s}': {e}"))?;
        if hi > u32::MAX as u64 || lo > u32::MAX as u64 {
            return Err(format!("invalid lsn '{s}': segment out of range"));
        }
        Ok(Lsn((hi << 32) | lo))
    }
}

impl Lsn {
    /// Lenient parse for values read from the wire; anything malformed is
    /// the invalid position.
    pub fn parse_lenient(s: &str) -> Lsn {
        s.parse().unwrap_or(Lsn::INVALID)
    }
}
