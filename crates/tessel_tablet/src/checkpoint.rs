//! Replication checkpoints on a destination shard.
//!
//! One row per source shard: the last change-log position whose effects are
//! durably applied locally. Seeded by restore, advanced together with each
//! applied batch, discarded when the source relationship ends.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use tessel_common::{KeyRange, TesselError, TesselResult};

/// Position bookkeeping table: source shard key range → applied position.
#[derive(Debug, Default)]
pub struct CheckpointTable {
    rows: Mutex<BTreeMap<KeyRange, u64>>,
}

impl CheckpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset) the checkpoint row for `source` at `pos`.
    pub fn seed(&self, source: KeyRange, pos: u64) {
        self.rows.lock().insert(source, pos);
    }

    pub fn get(&self, source: &KeyRange) -> Option<u64> {
        self.rows.lock().get(source).copied()
    }

    /// Advance the checkpoint for `source` to `pos`. The row must exist and
    /// positions only move forward; anything else means the bookkeeping no
    /// longer matches the applied data.
    pub fn advance(&self, source: &KeyRange, pos: u64) -> TesselResult<()> {
        let mut rows = self.rows.lock();
        match rows.get_mut(source) {
            None => Err(TesselError::StreamCorruption(format!(
                "no checkpoint row for source shard {source}"
            ))),
            Some(current) if *current > pos => Err(TesselError::StreamCorruption(format!(
                "checkpoint for {source} would move backwards: {current} -> {pos}"
            ))),
            Some(current) => {
                *current = pos;
                Ok(())
            }
        }
    }

    /// Drop the checkpoint row for `source` (migration completed).
    pub fn discard(&self, source: &KeyRange) {
        self.rows.lock().remove(source);
    }

    pub fn sources(&self) -> Vec<KeyRange> {
        self.rows.lock().keys().cloned().collect()
    }
}
