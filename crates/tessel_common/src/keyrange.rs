//! Keyspace-id and key-range arithmetic.
//!
//! A `KeyspaceId` is the sharding-key value of a row: a big-endian byte
//! string compared lexicographically, so a fixed-width unsigned integer key
//! packs to its 8-byte big-endian form and byte keys are used as-is.
//!
//! A `KeyRange` is a half-open interval `[start, end)` over that domain.
//! An empty `start` means the bottom of the key space, an empty `end` the
//! top. Ranges use the operator-visible hex form: `-80`, `80-c0`, `c0-`,
//! and `-` for the full space.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{TesselError, TesselResult};

/// The sharding-key value extracted from a row. Determines which shard owns
/// the row under any partitioning.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyspaceId(Vec<u8>);

impl KeyspaceId {
    /// Pack a fixed-width unsigned integer key as 8 big-endian bytes.
    pub fn from_u64(v: u64) -> Self {
        Self(v.to_be_bytes().to_vec())
    }

    /// Use an opaque byte-string key as-is.
    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Self {
        Self(b.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for KeyspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Half-open interval `[start, end)` over the keyspace-id domain.
/// Empty `start`/`end` bytes denote the unbounded low/high end.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    start: Vec<u8>,
    end: Vec<u8>,
}

impl KeyRange {
    /// Build a range from raw boundary bytes. An empty boundary is unbounded.
    /// Both boundaries set with `start >= end` is a `Config` error.
    pub fn new(start: Vec<u8>, end: Vec<u8>) -> TesselResult<Self> {
        if !start.is_empty() && !end.is_empty() && start >= end {
            return Err(TesselError::Config(format!(
                "invalid key range: start {} >= end {}",
                hex(&start),
                hex(&end)
            )));
        }
        Ok(Self { start, end })
    }

    /// The full key space `[-inf, +inf)`.
    pub fn full() -> Self {
        Self {
            start: Vec::new(),
            end: Vec::new(),
        }
    }

    pub fn start(&self) -> &[u8] {
        &self.start
    }

    pub fn end(&self) -> &[u8] {
        &self.end
    }

    pub fn is_full(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }

    /// True if `id` falls inside this range. Lexicographic byte comparison,
    /// so a short boundary acts as a prefix bound for longer keys.
    pub fn contains(&self, id: &KeyspaceId) -> bool {
        let k = id.as_bytes();
        (self.start.is_empty() || k >= self.start.as_slice())
            && (self.end.is_empty() || k < self.end.as_slice())
    }

    /// True if `other` is fully contained in `self`.
    pub fn contains_range(&self, other: &KeyRange) -> bool {
        let start_ok = self.start.is_empty()
            || (!other.start.is_empty() && other.start.as_slice() >= self.start.as_slice());
        let end_ok = self.end.is_empty()
            || (!other.end.is_empty() && other.end.as_slice() <= self.end.as_slice());
        start_ok && end_ok
    }

    /// True if the two ranges share any key.
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        let self_below = !self.end.is_empty()
            && !other.start.is_empty()
            && self.end.as_slice() <= other.start.as_slice();
        let other_below = !other.end.is_empty()
            && !self.start.is_empty()
            && other.end.as_slice() <= self.start.as_slice();
        !(self_below || other_below)
    }

    /// True if `other` starts exactly where `self` ends.
    pub fn is_sibling_below(&self, other: &KeyRange) -> bool {
        !self.end.is_empty() && self.end == other.start
    }

    /// True if `ranges` reconstruct exactly this range: sorted by start they
    /// must begin at `self.start`, chain end-to-start with no gap or
    /// overlap, and finish at `self.end`.
    pub fn covered_exactly_by(&self, ranges: &[KeyRange]) -> bool {
        if ranges.is_empty() {
            return false;
        }
        let mut sorted: Vec<&KeyRange> = ranges.iter().collect();
        sorted.sort_by(|a, b| a.start.cmp(&b.start));
        if sorted[0].start != self.start {
            return false;
        }
        for pair in sorted.windows(2) {
            if pair[0].end.is_empty() || pair[0].end != pair[1].start {
                return false;
            }
        }
        sorted[sorted.len() - 1].end == self.end
    }

    /// Verify that `ranges` tile the full key space exactly.
    pub fn tiles_full_space(ranges: &[KeyRange]) -> bool {
        KeyRange::full().covered_exactly_by(ranges)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", hex(&self.start), hex(&self.end))
    }
}

impl FromStr for KeyRange {
    type Err = TesselError;

    /// Parse the `start-end` hex form: `-80`, `80-c0`, `c0-`, `-`.
    fn from_str(s: &str) -> TesselResult<Self> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| TesselError::Config(format!("invalid key range {s:?}: missing '-'")))?;
        KeyRange::new(unhex(start)?, unhex(end)?)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn unhex(s: &str) -> TesselResult<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(TesselError::Config(format!(
            "invalid key range boundary {s:?}: odd hex length"
        )));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| {
                TesselError::Config(format!("invalid key range boundary {s:?}: bad hex"))
            })
        })
        .collect()
}
