use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use tessel_common::{KeyRange, TabletId, TabletType};

/// A key-range partition of a keyspace, backed by a set of tablets.
///
/// `served_types` records, per cell, which roles this shard is currently
/// authoritative for. `source_shards` is non-empty exactly while the shard
/// is still importing filtered replication from a parent; such a shard
/// serves nothing until the migration coordinator moves roles onto it.
#[derive(Debug, Clone)]
pub struct Shard {
    pub keyspace: String,
    pub key_range: KeyRange,
    pub tablets: BTreeSet<TabletId>,
    pub master: Option<TabletId>,
    pub cells: BTreeSet<String>,
    served_types: BTreeMap<String, BTreeSet<TabletType>>,
    pub source_shards: Vec<KeyRange>,
}

impl Shard {
    pub fn new(keyspace: impl Into<String>, key_range: KeyRange, source_shards: Vec<KeyRange>) -> Self {
        Self {
            keyspace: keyspace.into(),
            key_range,
            tablets: BTreeSet::new(),
            master: None,
            cells: BTreeSet::new(),
            served_types: BTreeMap::new(),
            source_shards,
        }
    }

    /// Operator-visible shard name, e.g. `80-c0`.
    pub fn name(&self) -> String {
        self.key_range.to_string()
    }

    /// A shard is authoritative from birth unless it was created as a child
    /// still importing from a parent.
    pub fn is_authoritative(&self) -> bool {
        self.source_shards.is_empty()
    }

    pub fn serves(&self, cell: &str, tablet_type: TabletType) -> bool {
        self.served_types
            .get(cell)
            .is_some_and(|s| s.contains(&tablet_type))
    }

    pub fn serves_any_in_cell(&self, cell: &str) -> bool {
        self.served_types.get(cell).is_some_and(|s| !s.is_empty())
    }

    pub fn served_types_in_cell(&self, cell: &str) -> BTreeSet<TabletType> {
        self.served_types.get(cell).cloned().unwrap_or_default()
    }

    pub fn add_served_type(&mut self, cell: &str, tablet_type: TabletType) {
        self.served_types
            .entry(cell.to_string())
            .or_default()
            .insert(tablet_type);
    }

    pub fn remove_served_type(&mut self, cell: &str, tablet_type: TabletType) {
        if let Some(set) = self.served_types.get_mut(cell) {
            set.remove(&tablet_type);
        }
    }

    /// Drop all per-cell state for `cell` (RemoveShardCell).
    pub fn remove_cell(&mut self, cell: &str) {
        self.cells.remove(cell);
        self.served_types.remove(cell);
    }

    /// Serde view returned by `GetShard`.
    pub fn record(&self) -> ShardRecord {
        ShardRecord {
            keyspace: self.keyspace.clone(),
            shard: self.name(),
            cells: self.cells.iter().cloned().collect(),
            served_types: self
                .served_types
                .iter()
                .filter(|(_, types)| !types.is_empty())
                .map(|(cell, types)| {
                    (
                        cell.clone(),
                        types.iter().map(|t| t.to_string()).collect(),
                    )
                })
                .collect(),
            source_shards: self.source_shards.iter().map(|r| r.to_string()).collect(),
            master: self.master,
            tablets: self.tablets.iter().copied().collect(),
        }
    }
}

/// JSON-serializable shard record, the `GetShard` contract.
#[derive(Debug, Clone, Serialize)]
pub struct ShardRecord {
    pub keyspace: String,
    pub shard: String,
    pub cells: Vec<String>,
    pub served_types: BTreeMap<String, Vec<String>>,
    pub source_shards: Vec<String>,
    pub master: Option<TabletId>,
    pub tablets: Vec<TabletId>,
}
