//! Snapshot/copy engine: point-in-time, range-partitioned export of a
//! source shard plus the change-log position to resume replication from.
//!
//! The export is taken with the source's apply lock held, so the rows and
//! the position describe exactly one instant. Restore is all-or-nothing per
//! destination: a failed load wipes whatever it already wrote and surfaces
//! `CopyFailure`. A split attempt is retried from a fresh snapshot, never
//! resumed mid-copy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use tessel_common::{KeyRange, TesselError, TesselResult};
use tessel_tablet::{ChangeOp, Row, RowChange, ShardEngine};

/// Whether restore pre-populates the replication bookkeeping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreStrategy {
    /// Seed the checkpoint row `(source shard, position)` so a binlog player
    /// can start immediately.
    PopulateCheckpoint,
    /// Load data only; the operator seeds checkpoints separately.
    SkipCheckpoint,
}

/// One destination's slice of the export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPartition {
    pub range: KeyRange,
    /// table name → rows, ordered by (keyspace id, primary key).
    pub tables: BTreeMap<String, Vec<Row>>,
    pub checksum: u64,
}

impl SnapshotPartition {
    fn compute_checksum(tables: &BTreeMap<String, Vec<Row>>) -> u64 {
        let mut buf = Vec::new();
        for (name, rows) in tables {
            buf.extend_from_slice(name.as_bytes());
            for row in rows {
                buf.extend_from_slice(&row.checksum().to_be_bytes());
            }
        }
        xxh3_64(&buf)
    }

    pub fn row_count(&self) -> usize {
        self.tables.values().map(|rows| rows.len()).sum()
    }
}

/// The result of `take_snapshot`: per-range exports plus the replication
/// resume point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub source_range: KeyRange,
    /// Change-log position at which the export was taken.
    pub position: u64,
    pub partitions: Vec<SnapshotPartition>,
}

/// Export the source shard's rows, already partitioned by destination key
/// range, at a single point in time. Enables the source's binlog streaming
/// service as a side effect so players can connect afterwards.
pub fn take_snapshot(
    source: &ShardEngine,
    dest_ranges: &[KeyRange],
) -> TesselResult<SnapshotManifest> {
    if !source.key_range().covered_exactly_by(dest_ranges) {
        return Err(TesselError::Config(format!(
            "destination ranges {:?} do not partition source range {}",
            dest_ranges.iter().map(|r| r.to_string()).collect::<Vec<_>>(),
            source.key_range(),
        )));
    }
    let manifest = source.with_frozen(|engine| {
        let position = engine.binlog().current_position();
        let partitions = dest_ranges
            .iter()
            .map(|range| {
                let mut tables = BTreeMap::new();
                for table in engine.store().table_names() {
                    let rows = engine.store().scan_range(&table, range);
                    if !rows.is_empty() {
                        tables.insert(table, rows);
                    }
                }
                let checksum = SnapshotPartition::compute_checksum(&tables);
                SnapshotPartition {
                    range: range.clone(),
                    tables,
                    checksum,
                }
            })
            .collect();
        engine.binlog().enable_server();
        SnapshotManifest {
            source_range: engine.key_range().clone(),
            position,
            partitions,
        }
    });
    tracing::info!(
        source = %manifest.source_range,
        position = manifest.position,
        partitions = manifest.partitions.len(),
        rows = manifest.partitions.iter().map(|p| p.row_count()).sum::<usize>(),
        "snapshot taken",
    );
    Ok(manifest)
}

/// Bulk-load the partition matching the destination's key range and record
/// the replication checkpoint. Any failure wipes the partially loaded rows
/// and is fatal to this copy attempt.
pub fn restore(
    dest: &ShardEngine,
    manifest: &SnapshotManifest,
    strategy: RestoreStrategy,
) -> TesselResult<()> {
    let partition = manifest
        .partitions
        .iter()
        .find(|p| p.range == *dest.key_range())
        .ok_or_else(|| {
            TesselError::CopyFailure(format!(
                "snapshot of {} has no partition for destination {}",
                manifest.source_range,
                dest.key_range(),
            ))
        })?;
    if SnapshotPartition::compute_checksum(&partition.tables) != partition.checksum {
        return Err(TesselError::CopyFailure(format!(
            "partition {} failed checksum verification",
            partition.range
        )));
    }
    for (table, rows) in &partition.tables {
        let changes: Vec<RowChange> = rows
            .iter()
            .map(|row| RowChange {
                op: ChangeOp::Insert,
                table: table.clone(),
                row: row.clone(),
            })
            .collect();
        if let Err(e) = dest.store().apply(&changes) {
            // never resume a partial load: wipe and force a fresh snapshot
            for wiped in partition.tables.keys() {
                dest.store().clear_range(wiped, &partition.range);
            }
            return Err(TesselError::CopyFailure(format!(
                "bulk load of table {table} into {} failed: {e}",
                dest.key_range(),
            )));
        }
    }
    if strategy == RestoreStrategy::PopulateCheckpoint {
        dest.checkpoints()
            .seed(manifest.source_range.clone(), manifest.position);
    }
    tracing::info!(
        dest = %dest.key_range(),
        source = %manifest.source_range,
        position = manifest.position,
        rows = partition.row_count(),
        strategy = ?strategy,
        "restore complete",
    );
    Ok(())
}
