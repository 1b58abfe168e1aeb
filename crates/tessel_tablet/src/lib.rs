//! The storage-node model: per-shard row store, structured change log,
//! replication checkpoints, and the observable counters a tablet process
//! exports.
//!
//! The real SQL engine is an external collaborator; `TabletStore` models the
//! slice of its contract the orchestrator depends on: transactional row
//! application, ordered range scans, and primary-key uniqueness.

pub mod binlog;
pub mod checkpoint;
pub mod engine;
pub mod store;

pub use binlog::{Binlog, BinlogEvent, BinlogServerState, ChangeOp, FilteredBatch, RowChange};
pub use checkpoint::CheckpointTable;
pub use engine::ShardEngine;
pub use store::{Row, TabletStore};
