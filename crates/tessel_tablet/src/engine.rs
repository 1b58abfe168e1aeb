//! `ShardEngine`, the data plane of one shard.
//!
//! Bundles the row store, change log, and checkpoint table behind the two
//! write paths the orchestrator distinguishes:
//!
//! - `execute_txn`: the client path on a source shard. Applies the rows and
//!   appends one change-log transaction, in commit order.
//! - `apply_replicated`: the filtered-replication path on a destination.
//!   Applies a source transaction and advances the matching checkpoint as
//!   one unit, so the checkpoint is never visible ahead of the applied data.
//!
//! Both run under one apply lock, which also gives `snapshot`-style readers
//! a transactionally consistent point to freeze at.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use tessel_common::{KeyRange, TesselResult};

use crate::binlog::{Binlog, RowChange};
use crate::checkpoint::CheckpointTable;
use crate::store::TabletStore;

/// Data plane of one shard, shared by all of that shard's tablets.
pub struct ShardEngine {
    keyspace: String,
    key_range: KeyRange,
    store: TabletStore,
    binlog: Binlog,
    checkpoints: CheckpointTable,
    /// Serializes local commits, replicated applies and snapshot freezes.
    apply_lock: Mutex<()>,
    /// Live binlog players applying into this shard (gauge).
    active_players: AtomicU64,
}

impl ShardEngine {
    pub fn new(keyspace: impl Into<String>, key_range: KeyRange) -> Arc<Self> {
        Arc::new(Self {
            keyspace: keyspace.into(),
            key_range,
            store: TabletStore::new(),
            binlog: Binlog::new(),
            checkpoints: CheckpointTable::new(),
            apply_lock: Mutex::new(()),
            active_players: AtomicU64::new(0),
        })
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn key_range(&self) -> &KeyRange {
        &self.key_range
    }

    pub fn store(&self) -> &TabletStore {
        &self.store
    }

    pub fn binlog(&self) -> &Binlog {
        &self.binlog
    }

    pub fn checkpoints(&self) -> &CheckpointTable {
        &self.checkpoints
    }

    /// Client write path: commit one transaction locally and log it.
    /// Returns the transaction's change-log position.
    pub fn execute_txn(&self, changes: Vec<RowChange>) -> TesselResult<u64> {
        let _guard = self.apply_lock.lock();
        self.store.apply(&changes)?;
        Ok(self.binlog.append(changes))
    }

    /// Replication apply path: apply one filtered source transaction and
    /// advance the checkpoint for `source` to `pos`, atomically.
    pub fn apply_replicated(
        &self,
        changes: &[RowChange],
        source: &KeyRange,
        pos: u64,
    ) -> TesselResult<()> {
        let _guard = self.apply_lock.lock();
        self.store.apply(changes)?;
        self.checkpoints.advance(source, pos)
    }

    /// Advance the checkpoint over trailing source transactions that
    /// filtered to nothing for this shard.
    pub fn advance_checkpoint(&self, source: &KeyRange, pos: u64) -> TesselResult<()> {
        let _guard = self.apply_lock.lock();
        self.checkpoints.advance(source, pos)
    }

    /// Run `f` at a frozen point in time: no commit or replicated apply can
    /// interleave. Used by the snapshot engine.
    pub fn with_frozen<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        let _guard = self.apply_lock.lock();
        f(self)
    }

    pub fn inc_players(&self) {
        self.active_players.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_players(&self) {
        self.active_players.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn binlog_player_count(&self) -> u64 {
        self.active_players.load(Ordering::SeqCst)
    }

    /// Observable counters, the status-endpoint contract of a tablet
    /// process. Key names are stable.
    pub fn status_vars(&self) -> serde_json::Value {
        json!({
            "UpdateStreamKeyRangeStatements": self.binlog.statements_streamed(),
            "UpdateStreamKeyRangeTransactions": self.binlog.transactions_streamed(),
            "BinlogPlayerCount": self.binlog_player_count(),
            "BinlogServerState": self.binlog.server_state().to_string(),
        })
    }
}

impl std::fmt::Debug for ShardEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardEngine")
            .field("keyspace", &self.keyspace)
            .field("key_range", &self.key_range.to_string())
            .field("players", &self.binlog_player_count())
            .finish()
    }
}
