//! In-memory ordered row store, one per shard.
//!
//! Stands in for the external SQL engine behind the contract the
//! orchestrator needs: all-or-nothing multi-row application, primary-key
//! uniqueness (upsert on replay keeps re-application idempotent), and range
//! scans ordered by keyspace id for the diff checker. A fault-injection
//! counter lets tests exercise the streamers' transient-error retry path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use tessel_common::{KeyRange, KeyspaceId, TesselError, TesselResult};

use crate::binlog::{ChangeOp, RowChange};

/// One row: primary key `id`, payload `msg`, and the typed sharding-key
/// value that determines which shard owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub id: u64,
    pub msg: String,
    pub keyspace_id: KeyspaceId,
}

impl Row {
    pub fn new(id: u64, msg: impl Into<String>, keyspace_id: KeyspaceId) -> Self {
        Self {
            id,
            msg: msg.into(),
            keyspace_id,
        }
    }

    /// Content checksum used by the diff checker and snapshot manifests.
    pub fn checksum(&self) -> u64 {
        let mut buf = Vec::with_capacity(8 + self.msg.len() + self.keyspace_id.as_bytes().len());
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(self.msg.as_bytes());
        buf.extend_from_slice(self.keyspace_id.as_bytes());
        xxh3_64(&buf)
    }
}

/// Per-shard row storage: table name → (primary key → row).
#[derive(Debug, Default)]
pub struct TabletStore {
    tables: RwLock<BTreeMap<String, BTreeMap<u64, Row>>>,
    /// Remaining writes to fail with a transient error (test hook).
    fail_writes: AtomicU64,
}

impl TabletStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one transaction's row changes, all-or-nothing.
    ///
    /// Inserts upsert on conflict and deletes of absent rows are no-ops, so
    /// replaying an already-applied transaction converges to the same state
    /// (a crash between apply and checkpoint advance is safe to replay).
    pub fn apply(&self, changes: &[RowChange]) -> TesselResult<()> {
        let mut remaining = self.fail_writes.load(Ordering::SeqCst);
        while remaining > 0 {
            match self.fail_writes.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Err(TesselError::transient("injected write failure", 50)),
                Err(actual) => remaining = actual,
            }
        }
        let mut tables = self.tables.write();
        for change in changes {
            let table = tables.entry(change.table.clone()).or_default();
            match change.op {
                ChangeOp::Insert | ChangeOp::Update => {
                    table.insert(change.row.id, change.row.clone());
                }
                ChangeOp::Delete => {
                    table.remove(&change.row.id);
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, table: &str, id: u64) -> Option<Row> {
        self.tables.read().get(table)?.get(&id).cloned()
    }

    /// All rows of `table` whose keyspace id falls in `range`, ordered by
    /// (keyspace id, primary key).
    pub fn scan_range(&self, table: &str, range: &KeyRange) -> Vec<Row> {
        let tables = self.tables.read();
        let mut rows: Vec<Row> = tables
            .get(table)
            .map(|t| {
                t.values()
                    .filter(|r| range.contains(&r.keyspace_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| (&a.keyspace_id, a.id).cmp(&(&b.keyspace_id, b.id)));
        rows
    }

    /// Delete every row of `table` inside `range`. Used to wipe a partial
    /// bulk load before surfacing a copy failure.
    pub fn clear_range(&self, table: &str, range: &KeyRange) -> usize {
        let mut tables = self.tables.write();
        match tables.get_mut(table) {
            Some(t) => {
                let before = t.len();
                t.retain(|_, r| !range.contains(&r.keyspace_id));
                before - t.len()
            }
            None => 0,
        }
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |t| t.len())
    }

    /// Fail the next `n` `apply` calls with a transient error.
    pub fn inject_write_failures(&self, n: u64) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(table: &str, id: u64, msg: &str, ksid: u64) -> RowChange {
        RowChange {
            op: ChangeOp::Insert,
            table: table.into(),
            row: Row::new(id, msg, KeyspaceId::from_u64(ksid)),
        }
    }

    #[test]
    fn test_apply_and_scan_ordered() {
        let store = TabletStore::new();
        store
            .apply(&[
                insert("resharding1", 3, "msg3", 0xD000000000000000),
                insert("resharding1", 2, "msg2", 0x9000000000000000),
            ])
            .unwrap();
        let rows = store.scan_range("resharding1", &"80-".parse().unwrap());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, 2); // 0x90.. sorts before 0xd0..
        assert_eq!(rows[1].id, 3);

        let low = store.scan_range("resharding1", &"-80".parse().unwrap());
        assert!(low.is_empty());
    }

    #[test]
    fn test_replay_is_idempotent() {
        let store = TabletStore::new();
        let txn = vec![insert("t", 1, "a", 0x10)];
        store.apply(&txn).unwrap();
        store.apply(&txn).unwrap();
        assert_eq!(store.row_count("t"), 1);

        let del = vec![RowChange {
            op: ChangeOp::Delete,
            table: "t".into(),
            row: Row::new(1, "", KeyspaceId::from_u64(0x10)),
        }];
        store.apply(&del).unwrap();
        store.apply(&del).unwrap();
        assert_eq!(store.row_count("t"), 0);
    }

    #[test]
    fn test_update_overwrites() {
        let store = TabletStore::new();
        store.apply(&[insert("t", 1, "old", 0x10)]).unwrap();
        store
            .apply(&[RowChange {
                op: ChangeOp::Update,
                table: "t".into(),
                row: Row::new(1, "new", KeyspaceId::from_u64(0x10)),
            }])
            .unwrap();
        assert_eq!(store.get("t", 1).unwrap().msg, "new");
    }

    #[test]
    fn test_clear_range_only_touches_range() {
        let store = TabletStore::new();
        store
            .apply(&[
                insert("t", 1, "low", 0x1000000000000000),
                insert("t", 2, "high", 0x9000000000000000),
            ])
            .unwrap();
        let removed = store.clear_range("t", &"80-".parse().unwrap());
        assert_eq!(removed, 1);
        assert!(store.get("t", 1).is_some());
        assert!(store.get("t", 2).is_none());
    }

    #[test]
    fn test_injected_failures_are_transient() {
        let store = TabletStore::new();
        store.inject_write_failures(2);
        let txn = vec![insert("t", 1, "a", 0x10)];
        assert!(store.apply(&txn).unwrap_err().is_transient());
        assert!(store.apply(&txn).unwrap_err().is_transient());
        store.apply(&txn).unwrap();
        assert_eq!(store.row_count("t"), 1);
    }

    #[test]
    fn test_checksum_tracks_content() {
        let a = Row::new(1, "msg", KeyspaceId::from_u64(0x10));
        let b = Row::new(1, "msg", KeyspaceId::from_u64(0x10));
        let c = Row::new(1, "other", KeyspaceId::from_u64(0x10));
        assert_eq!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), c.checksum());
    }
}
