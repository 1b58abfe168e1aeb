//! `ReshardingAdmin`, the operator-facing command surface.
//!
//! One method per conceptual command (`CreateKeyspace`, `MultiSnapshot`,
//! `MigrateServedTypes`, ...). Methods return `TesselError`s whose `code()`
//! is the stable machine-parseable failure kind a CLI front-end would map to
//! a non-zero exit. Argument parsing and process lifecycle stay outside;
//! this layer owns the topology registry, the per-shard engines, the player
//! registry and the migration coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use tessel_common::{
    KeyRange, KeyspaceIdType, ReshardingConfig, TabletId, TabletType, TesselError, TesselResult,
};
use tessel_tablet::ShardEngine;
use tessel_topo::TopoRegistry;

use crate::diff::{self, DiffReport};
use crate::migrate::MigrationCoordinator;
use crate::player::PlayerRegistry;
use crate::snapshot::{self, RestoreStrategy, SnapshotManifest};

/// The deployment context: topology, data planes, players, migrations.
/// Owned by the harness that runs the orchestration, not a process-wide
/// singleton.
pub struct ReshardingAdmin {
    config: ReshardingConfig,
    topo: TopoRegistry,
    engines: DashMap<(String, KeyRange), Arc<ShardEngine>>,
    tablet_engines: DashMap<TabletId, Arc<ShardEngine>>,
    players: PlayerRegistry,
    coordinator: MigrationCoordinator,
    snapshots: Mutex<HashMap<(String, KeyRange), Arc<SnapshotManifest>>>,
}

impl ReshardingAdmin {
    pub fn new(config: ReshardingConfig) -> Self {
        Self {
            config,
            topo: TopoRegistry::new(),
            engines: DashMap::new(),
            tablet_engines: DashMap::new(),
            players: PlayerRegistry::new(),
            coordinator: MigrationCoordinator::new(),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ReshardingConfig {
        &self.config
    }

    pub fn topo(&self) -> &TopoRegistry {
        &self.topo
    }

    // ── keyspace & tablet lifecycle ──────────────────────────────────────

    pub fn create_keyspace(
        &self,
        name: &str,
        sharding_column: Option<&str>,
        sharding_key_type: Option<KeyspaceIdType>,
    ) -> TesselResult<()> {
        self.topo
            .create_keyspace(name, sharding_column, sharding_key_type)
    }

    pub fn set_keyspace_sharding_info(
        &self,
        keyspace: &str,
        column: &str,
        key_type: KeyspaceIdType,
        force: bool,
    ) -> TesselResult<()> {
        self.topo
            .set_sharding_info(keyspace, column, key_type, force)
    }

    /// Register a tablet and bind it to its shard's data plane (created on
    /// first use, shared by all tablets of the shard).
    pub fn init_tablet(
        &self,
        id: TabletId,
        cell: &str,
        tablet_type: TabletType,
        keyspace: &str,
        range: &str,
    ) -> TesselResult<()> {
        let range: KeyRange = range.parse()?;
        self.topo
            .init_tablet(id, cell, tablet_type, keyspace, &range)?;
        let engine = self
            .engines
            .entry((keyspace.to_string(), range.clone()))
            .or_insert_with(|| ShardEngine::new(keyspace, range))
            .value()
            .clone();
        self.tablet_engines.insert(id, engine);
        Ok(())
    }

    pub fn reparent_shard(
        &self,
        keyspace: &str,
        range: &str,
        master: TabletId,
        force: bool,
    ) -> TesselResult<()> {
        self.topo
            .reparent(keyspace, &range.parse()?, master, force)
    }

    pub fn change_slave_type(&self, id: TabletId, tablet_type: TabletType) -> TesselResult<()> {
        self.topo.change_tablet_type(id, tablet_type)
    }

    pub fn scrap_tablet(&self, id: TabletId) -> TesselResult<()> {
        self.topo.scrap_tablet(id)
    }

    // ── serving graph ────────────────────────────────────────────────────

    pub fn rebuild_keyspace_graph(&self, keyspace: &str) -> TesselResult<()> {
        self.topo.rebuild_graph(keyspace)
    }

    /// Stable partition text for one cell (the serving-graph query).
    pub fn srv_keyspace(&self, cell: &str, keyspace: &str) -> TesselResult<String> {
        self.topo.serving_graph_text(keyspace, cell)
    }

    // ── snapshot / restore / replication ─────────────────────────────────

    /// Take a point-in-time, range-partitioned export of the source tablet's
    /// shard. Returns the change-log position the export was taken at.
    pub fn multi_snapshot(&self, source: TabletId, dest_ranges: &[&str]) -> TesselResult<u64> {
        let engine = self.tablet_engine(source)?;
        let ranges = dest_ranges
            .iter()
            .map(|s| s.parse())
            .collect::<TesselResult<Vec<KeyRange>>>()?;
        let manifest = snapshot::take_snapshot(&engine, &ranges)?;
        let position = manifest.position;
        self.snapshots.lock().insert(
            (engine.keyspace().to_string(), engine.key_range().clone()),
            Arc::new(manifest),
        );
        Ok(position)
    }

    /// Bulk-load the destination shard from the source tablet's latest
    /// snapshot. With `PopulateCheckpoint` the replication bookkeeping is
    /// seeded and a binlog player is started for the destination.
    pub fn shard_multi_restore(
        &self,
        keyspace: &str,
        dest_range: &str,
        source: TabletId,
        strategy: RestoreStrategy,
    ) -> TesselResult<()> {
        let dest_range: KeyRange = dest_range.parse()?;
        let dest = self.shard_engine(keyspace, &dest_range)?;
        let source_engine = self.tablet_engine(source)?;
        let manifest = self
            .snapshots
            .lock()
            .get(&(keyspace.to_string(), source_engine.key_range().clone()))
            .cloned()
            .ok_or_else(|| {
                TesselError::CopyFailure(format!(
                    "no snapshot of {keyspace}/{} available, run MultiSnapshot first",
                    source_engine.key_range(),
                ))
            })?;
        snapshot::restore(&dest, &manifest, strategy)?;
        if strategy == RestoreStrategy::PopulateCheckpoint {
            self.players.start_player(
                keyspace,
                source_engine,
                dest,
                self.config.player.clone(),
            )?;
        }
        Ok(())
    }

    /// Independent consistency check of a split relationship. For a child
    /// shard, its slice of the parent is compared against it; for a parent,
    /// the whole range is compared against the union of its children.
    /// A mismatch that survives the staleness re-check blocks migration.
    pub fn split_diff(&self, keyspace: &str, range: &str) -> TesselResult<DiffReport> {
        let range: KeyRange = range.parse()?;
        let (source_range, dest_ranges) = self.topo.with_keyspace(keyspace, |state| {
            let shard = state.shard(&range)?;
            if let Some(parent) = shard.source_shards.first() {
                Ok((parent.clone(), vec![range.clone()]))
            } else {
                let children = state.children_of(&range);
                if children.is_empty() {
                    return Err(TesselError::Precondition(format!(
                        "shard {keyspace}/{range} has no split relationship to diff"
                    )));
                }
                Ok((range.clone(), children))
            }
        })?;
        let source = self.shard_engine(keyspace, &source_range)?;
        let dests = dest_ranges
            .iter()
            .map(|r| self.shard_engine(keyspace, r))
            .collect::<TesselResult<Vec<_>>>()?;
        let report = diff::split_diff(&source, &range, &dests, &self.config.diff)?;
        if report.is_clean() {
            Ok(report)
        } else {
            let err = TesselError::Consistency(format!(
                "split diff of {keyspace}/{range} found discrepancies: {}",
                report.summary()
            ));
            err.log_if_consistency();
            Err(err)
        }
    }

    // ── migration & decommission ─────────────────────────────────────────

    pub fn migrate_served_types(
        &self,
        keyspace: &str,
        range: &str,
        tablet_type: TabletType,
        reverse: bool,
    ) -> TesselResult<()> {
        self.coordinator.migrate_served_type(
            &self.topo,
            &self.players,
            keyspace,
            &range.parse()?,
            tablet_type,
            reverse,
            &self.config.migrate,
        )
    }

    pub fn remove_shard_cell(&self, keyspace: &str, range: &str, cell: &str) -> TesselResult<()> {
        self.topo
            .remove_shard_from_cell(keyspace, &range.parse()?, cell)
    }

    pub fn delete_shard(&self, keyspace: &str, range: &str) -> TesselResult<()> {
        let range: KeyRange = range.parse()?;
        self.topo.delete_shard(keyspace, &range)?;
        self.engines.remove(&(keyspace.to_string(), range.clone()));
        self.snapshots
            .lock()
            .remove(&(keyspace.to_string(), range));
        Ok(())
    }

    /// The `GetShard` record as JSON.
    pub fn get_shard(&self, keyspace: &str, range: &str) -> TesselResult<serde_json::Value> {
        let record = self.topo.get_shard(keyspace, &range.parse()?)?;
        serde_json::to_value(&record)
            .map_err(|e| TesselError::Internal(format!("shard record serialization: {e}")))
    }

    // ── observability ────────────────────────────────────────────────────

    /// The tablet status endpoint's counter export.
    pub fn status_vars(&self, id: TabletId) -> TesselResult<serde_json::Value> {
        Ok(self.tablet_engine(id)?.status_vars())
    }

    /// Live binlog players applying into the tablet's shard.
    pub fn binlog_player_count(&self, id: TabletId) -> TesselResult<u64> {
        Ok(self.tablet_engine(id)?.binlog_player_count())
    }

    pub fn tablet_engine(&self, id: TabletId) -> TesselResult<Arc<ShardEngine>> {
        self.tablet_engines
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| TesselError::Precondition(format!("{id} has no bound engine")))
    }

    pub fn shard_engine(&self, keyspace: &str, range: &KeyRange) -> TesselResult<Arc<ShardEngine>> {
        self.engines
            .get(&(keyspace.to_string(), range.clone()))
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                TesselError::Precondition(format!(
                    "shard {keyspace}/{range} has no tablets yet"
                ))
            })
    }
}
