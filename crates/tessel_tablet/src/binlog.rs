//! Structured change log (binlog) for a source shard.
//!
//! Every committed transaction appends one `BinlogEvent` at a monotonic
//! position. Each row change carries the keyspace id as a typed field, so
//! filtered replication matches rows against a key range exactly instead of
//! parsing routing hints out of statement text.
//!
//! The log also owns the source-side streaming counters
//! (`keyrange_statements` / `keyrange_transactions`) that operators watch to
//! detect stalled streams, and the binlog-server lifecycle state that is
//! flipped to `Enabled` when a snapshot is taken.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use tessel_common::{KeyRange, KeyspaceId, TesselError, TesselResult};

use crate::store::Row;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOp::Insert => f.write_str("insert"),
            ChangeOp::Update => f.write_str("update"),
            ChangeOp::Delete => f.write_str("delete"),
        }
    }
}

/// One row change inside a transaction. For deletes the row carries the
/// primary key and keyspace id; the payload is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowChange {
    pub op: ChangeOp,
    pub table: String,
    pub row: Row,
}

impl RowChange {
    pub fn keyspace_id(&self) -> &KeyspaceId {
        &self.row.keyspace_id
    }
}

/// One committed source transaction at a change-log position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogEvent {
    pub pos: u64,
    pub changes: Vec<RowChange>,
}

/// Lifecycle of the binlog streaming service on a tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinlogServerState {
    Disabled,
    Enabled,
}

impl fmt::Display for BinlogServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinlogServerState::Disabled => f.write_str("Disabled"),
            BinlogServerState::Enabled => f.write_str("Enabled"),
        }
    }
}

/// A filtered read result: the events with at least one row in the requested
/// range, plus the position the scan advanced through. `through` can move
/// past the last returned event when trailing transactions had no matching
/// rows, letting the reader advance its checkpoint over them.
#[derive(Debug, Clone)]
pub struct FilteredBatch {
    pub events: Vec<BinlogEvent>,
    pub through: u64,
}

/// Append-only change log with monotonic positions starting at 1.
#[derive(Debug)]
pub struct Binlog {
    events: RwLock<Vec<BinlogEvent>>,
    next_pos: AtomicU64,
    server_state: Mutex<BinlogServerState>,
    keyrange_statements: AtomicU64,
    keyrange_transactions: AtomicU64,
}

impl Default for Binlog {
    fn default() -> Self {
        Self::new()
    }
}

impl Binlog {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            next_pos: AtomicU64::new(1),
            server_state: Mutex::new(BinlogServerState::Disabled),
            keyrange_statements: AtomicU64::new(0),
            keyrange_transactions: AtomicU64::new(0),
        }
    }

    /// Append one committed transaction. Returns its position.
    pub fn append(&self, changes: Vec<RowChange>) -> u64 {
        let pos = self.next_pos.fetch_add(1, Ordering::SeqCst);
        self.events.write().push(BinlogEvent { pos, changes });
        pos
    }

    /// Position of the newest event (0 = empty log).
    pub fn current_position(&self) -> u64 {
        self.next_pos.load(Ordering::SeqCst) - 1
    }

    /// Read up to `max_txns` transactions after `from_pos`, keeping only the
    /// row changes whose keyspace id falls in `range` and dropping
    /// transactions left empty by the filter.
    ///
    /// A `from_pos` ahead of the log is a corrupt checkpoint: the caller's
    /// resume point references history this log never produced.
    pub fn stream_filtered(
        &self,
        from_pos: u64,
        range: &KeyRange,
        max_txns: usize,
    ) -> TesselResult<FilteredBatch> {
        let current = self.current_position();
        if from_pos > current {
            return Err(TesselError::StreamCorruption(format!(
                "checkpoint position {from_pos} is ahead of change log position {current}"
            )));
        }
        let events = self.events.read();
        let mut out = Vec::new();
        let mut through = from_pos;
        let mut scanned = 0usize;
        for event in events.iter().filter(|e| e.pos > from_pos) {
            if scanned >= max_txns {
                break;
            }
            scanned += 1;
            through = event.pos;
            let changes: Vec<RowChange> = event
                .changes
                .iter()
                .filter(|c| range.contains(c.keyspace_id()))
                .cloned()
                .collect();
            if !changes.is_empty() {
                self.keyrange_statements
                    .fetch_add(changes.len() as u64, Ordering::Relaxed);
                self.keyrange_transactions.fetch_add(1, Ordering::Relaxed);
                out.push(BinlogEvent {
                    pos: event.pos,
                    changes,
                });
            }
        }
        Ok(FilteredBatch {
            events: out,
            through,
        })
    }

    /// Enable the streaming service (done when a snapshot is taken).
    pub fn enable_server(&self) {
        let mut state = self.server_state.lock();
        if *state != BinlogServerState::Enabled {
            *state = BinlogServerState::Enabled;
            tracing::info!("binlog streaming service enabled");
        }
    }

    pub fn server_state(&self) -> BinlogServerState {
        *self.server_state.lock()
    }

    pub fn statements_streamed(&self) -> u64 {
        self.keyrange_statements.load(Ordering::Relaxed)
    }

    pub fn transactions_streamed(&self) -> u64 {
        self.keyrange_transactions.load(Ordering::Relaxed)
    }
}
