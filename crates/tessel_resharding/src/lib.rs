//! The resharding orchestration core.
//!
//! Splits one serving key-range shard into non-overlapping children while
//! the cluster keeps taking reads and writes:
//!
//! ```text
//!   take_snapshot ──▶ SnapshotManifest ──▶ restore (per child)
//!                         │ position              │ checkpoint
//!                         ▼                       ▼
//!                  source change log ──▶ BinlogPlayer (filtered, per child)
//!                                              │
//!            split_diff (verify) ──────────────┤
//!                                              ▼
//!                  MigrationCoordinator: rdonly → replica → master
//!                                              │
//!                         cleanup: scrap / RemoveShardCell / DeleteShard
//! ```
//!
//! `ReshardingAdmin` exposes the whole flow as the command surface an
//! operator drives.

pub mod admin;
pub mod diff;
pub mod migrate;
pub mod player;
pub mod snapshot;
pub mod workload;

pub use admin::ReshardingAdmin;
pub use diff::{split_diff, DiffReport, RowRef};
pub use migrate::{MigrationCoordinator, MigrationState};
pub use player::{BinlogPlayer, PlayerHandle, PlayerMetricsSnapshot, PlayerRegistry};
pub use snapshot::{restore, take_snapshot, RestoreStrategy, SnapshotManifest, SnapshotPartition};
pub use workload::{InsertLoad, InsertLoadHandle, LagMonitor, LagMonitorHandle, LagStats};
