//! Topology registry: keyspaces, shards, tablets, and the serving graph.
//!
//! The registry is the single source of truth for routing: which shard owns
//! which key range, and which roles it serves in which cell, right now.
//! Every mutation runs under an exclusive per-keyspace lock so concurrent
//! migrations and rebuilds cannot lose updates, and every mutation leaves
//! state unchanged on failure.

pub mod keyspace;
pub mod registry;
pub mod serving_graph;
pub mod shard;
pub mod tablet;

pub use keyspace::Keyspace;
pub use registry::{KeyspaceState, TopoRegistry};
pub use serving_graph::CellGraph;
pub use shard::{Shard, ShardRecord};
pub use tablet::Tablet;
