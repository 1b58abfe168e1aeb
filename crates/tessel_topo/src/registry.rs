//! The topology registry: every durable routing fact lives here, and every
//! mutation runs under an exclusive per-keyspace lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use tessel_common::{
    KeyRange, KeyspaceIdType, TabletId, TabletType, TesselError, TesselResult,
};

use crate::keyspace::Keyspace;
use crate::serving_graph::CellGraph;
use crate::shard::{Shard, ShardRecord};
use crate::tablet::Tablet;

/// All topology state for one keyspace, guarded by one lock.
#[derive(Debug)]
pub struct KeyspaceState {
    pub info: Keyspace,
    pub shards: BTreeMap<KeyRange, Shard>,
    pub tablets: BTreeMap<TabletId, Tablet>,
    /// Last successfully published serving graph per cell.
    pub graphs: BTreeMap<String, CellGraph>,
}

impl KeyspaceState {
    pub fn shard(&self, range: &KeyRange) -> TesselResult<&Shard> {
        self.shards.get(range).ok_or_else(|| {
            TesselError::Precondition(format!(
                "shard {}/{range} does not exist",
                self.info.name
            ))
        })
    }

    pub fn shard_mut(&mut self, range: &KeyRange) -> TesselResult<&mut Shard> {
        let name = self.info.name.clone();
        self.shards.get_mut(range).ok_or_else(|| {
            TesselError::Precondition(format!("shard {name}/{range} does not exist"))
        })
    }

    pub fn tablet(&self, id: TabletId) -> TesselResult<&Tablet> {
        self.tablets
            .get(&id)
            .ok_or_else(|| TesselError::Precondition(format!("{id} does not exist")))
    }

    /// Shards that still list `parent` as a replication source.
    pub fn children_of(&self, parent: &KeyRange) -> Vec<KeyRange> {
        self.shards
            .values()
            .filter(|s| s.source_shards.contains(parent))
            .map(|s| s.key_range.clone())
            .collect()
    }

    /// Recompute the serving graph for every cell. All-or-nothing: on any
    /// tiling violation nothing is published and the previous graphs stay.
    pub fn rebuild_all_cells(&mut self) -> TesselResult<()> {
        let cells: Vec<String> = self
            .shards
            .values()
            .flat_map(|s| s.cells.iter().cloned())
            .collect();
        let mut fresh = BTreeMap::new();
        for cell in cells {
            if fresh.contains_key(&cell) {
                continue;
            }
            let graph = CellGraph::rebuild(&cell, self.shards.values())?;
            fresh.insert(cell, graph);
        }
        self.graphs = fresh;
        Ok(())
    }
}

/// Durable mapping keyspace → shards → key ranges → serving partitions.
/// The single mutation point for serving-graph state.
#[derive(Default)]
pub struct TopoRegistry {
    keyspaces: DashMap<String, Arc<Mutex<KeyspaceState>>>,
}

impl TopoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to one keyspace's state. Migration and
    /// rebuild use this for their read-modify-write cycles so that no two
    /// concurrent transitions can interleave.
    pub fn with_keyspace<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut KeyspaceState) -> TesselResult<R>,
    ) -> TesselResult<R> {
        let entry = self
            .keyspaces
            .get(name)
            .ok_or_else(|| TesselError::Precondition(format!("keyspace {name} does not exist")))?
            .value()
            .clone();
        let mut state = entry.lock();
        f(&mut state)
    }

    pub fn create_keyspace(
        &self,
        name: &str,
        sharding_column: Option<&str>,
        sharding_key_type: Option<KeyspaceIdType>,
    ) -> TesselResult<()> {
        if self.keyspaces.contains_key(name) {
            return Err(TesselError::Precondition(format!(
                "keyspace {name} already exists"
            )));
        }
        tracing::info!(keyspace = name, "creating keyspace");
        self.keyspaces.insert(
            name.to_string(),
            Arc::new(Mutex::new(KeyspaceState {
                info: Keyspace::new(
                    name,
                    sharding_column.map(|c| c.to_string()),
                    sharding_key_type,
                ),
                shards: BTreeMap::new(),
                tablets: BTreeMap::new(),
                graphs: BTreeMap::new(),
            })),
        );
        Ok(())
    }

    pub fn set_sharding_info(
        &self,
        keyspace: &str,
        column: &str,
        key_type: KeyspaceIdType,
        force: bool,
    ) -> TesselResult<()> {
        self.with_keyspace(keyspace, |state| {
            state.info.set_sharding_info(column, key_type, force)
        })
    }

    /// Create a shard for `range`. If an existing shard's range strictly
    /// contains `range`, the new shard is a child of it: it starts
    /// non-authoritative with `source_shards = [parent]` and serves nothing
    /// until the migration coordinator moves roles onto it.
    pub fn create_shard(&self, keyspace: &str, range: KeyRange) -> TesselResult<()> {
        self.with_keyspace(keyspace, |state| {
            Self::create_shard_locked(state, range).map(|_| ())
        })
    }

    fn create_shard_locked(state: &mut KeyspaceState, range: KeyRange) -> TesselResult<&mut Shard> {
        if state.shards.contains_key(&range) {
            return Err(TesselError::Precondition(format!(
                "shard {}/{range} already exists",
                state.info.name
            )));
        }
        let parent = state
            .shards
            .values()
            .find(|s| s.key_range.contains_range(&range) && s.key_range != range)
            .map(|s| s.key_range.clone());
        let source_shards = parent.clone().into_iter().collect::<Vec<_>>();
        tracing::info!(
            keyspace = %state.info.name,
            shard = %range,
            source = ?parent.as_ref().map(|p| p.to_string()),
            "creating shard",
        );
        let keyspace = state.info.name.clone();
        Ok(state
            .shards
            .entry(range.clone())
            .or_insert_with(|| Shard::new(keyspace, range, source_shards)))
    }

    /// Register a tablet, creating its shard on first use. An authoritative
    /// shard serves every role in a cell from the moment the cell appears;
    /// roles without a dedicated tablet fall back to the others. A child
    /// shard serves nothing until migration moves roles onto it.
    pub fn init_tablet(
        &self,
        id: TabletId,
        cell: &str,
        tablet_type: TabletType,
        keyspace: &str,
        range: &KeyRange,
    ) -> TesselResult<()> {
        self.with_keyspace(keyspace, |state| {
            if state.tablets.contains_key(&id) {
                return Err(TesselError::Precondition(format!("{id} already exists")));
            }
            if !state.shards.contains_key(range) {
                Self::create_shard_locked(state, range.clone())?;
            }
            let shard = state.shards.get_mut(range).expect("shard just ensured");
            shard.tablets.insert(id);
            shard.cells.insert(cell.to_string());
            let authoritative = shard.is_authoritative();
            if tablet_type == TabletType::Master && shard.master.is_none() {
                shard.master = Some(id);
            }
            if authoritative {
                for served in TabletType::SERVING {
                    shard.add_served_type(cell, served);
                }
            }
            let mut tablet = Tablet::new(id, cell, keyspace, range.clone(), tablet_type);
            tablet.refresh_state(authoritative);
            state.tablets.insert(id, tablet);
            tracing::info!(
                keyspace = keyspace,
                shard = %range,
                tablet = %id,
                tablet_type = %tablet_type,
                "tablet initialized",
            );
            Ok(())
        })
    }

    /// Make `new_master` the shard's master. Fails with `Conflict` if the
    /// tablet is not part of the shard, or, without `force`, if a live
    /// master already exists. The previous master is demoted to replica.
    pub fn reparent(
        &self,
        keyspace: &str,
        range: &KeyRange,
        new_master: TabletId,
        force: bool,
    ) -> TesselResult<()> {
        self.with_keyspace(keyspace, |state| {
            let shard = state.shard(range)?;
            if !shard.tablets.contains(&new_master) {
                return Err(TesselError::Conflict(format!(
                    "{new_master} is not part of shard {keyspace}/{range}"
                )));
            }
            let old_master = shard.master;
            if let Some(old) = old_master {
                let old_alive = state
                    .tablets
                    .get(&old)
                    .is_some_and(|t| !t.is_scrapped());
                if old != new_master && old_alive && !force {
                    return Err(TesselError::Conflict(format!(
                        "shard {keyspace}/{range} already has live master {old}, use force"
                    )));
                }
            }
            let authoritative = state.shard(range)?.is_authoritative();
            if let Some(old) = old_master.filter(|o| *o != new_master) {
                if let Some(t) = state.tablets.get_mut(&old) {
                    if !t.is_scrapped() {
                        t.tablet_type = TabletType::Replica;
                        t.refresh_state(authoritative);
                    }
                }
            }
            let tablet = state
                .tablets
                .get_mut(&new_master)
                .ok_or_else(|| TesselError::Conflict(format!("{new_master} does not exist")))?;
            if tablet.is_scrapped() {
                return Err(TesselError::Conflict(format!("{new_master} is scrapped")));
            }
            tablet.tablet_type = TabletType::Master;
            tablet.refresh_state(authoritative);
            state.shard_mut(range)?.master = Some(new_master);
            tracing::info!(
                keyspace = keyspace,
                shard = %range,
                master = %new_master,
                old_master = ?old_master.map(|t| t.to_string()),
                "shard reparented",
            );
            Ok(())
        })
    }

    /// Change a tablet's role (ChangeSlaveType). Master transitions must go
    /// through `reparent`.
    pub fn change_tablet_type(&self, id: TabletId, new_type: TabletType) -> TesselResult<()> {
        let keyspace = self.keyspace_of_tablet(id)?;
        self.with_keyspace(&keyspace, |state| {
            let tablet = state.tablets.get_mut(&id).ok_or_else(|| {
                TesselError::Precondition(format!("{id} does not exist"))
            })?;
            if tablet.is_scrapped() {
                return Err(TesselError::Precondition(format!("{id} is scrapped")));
            }
            if new_type == TabletType::Master {
                return Err(TesselError::Precondition(
                    "cannot promote to master with a type change, use reparent".into(),
                ));
            }
            let range = tablet.key_range.clone();
            let cell = tablet.cell.clone();
            let shard = state.shard(&range)?;
            if shard.master == Some(id) {
                return Err(TesselError::Precondition(format!(
                    "{id} is the master of {}/{}, reparent first",
                    keyspace,
                    shard.name()
                )));
            }
            let authoritative = shard.is_authoritative();
            let tablet = state.tablets.get_mut(&id).expect("checked above");
            tablet.tablet_type = new_type;
            tablet.refresh_state(authoritative);
            tracing::info!(tablet = %id, cell = %cell, new_type = %new_type, "tablet type changed");
            Ok(())
        })
    }

    /// Decommission a tablet: non-serving, removed from the shard's active
    /// set. The record remains until its cell is removed from the shard.
    pub fn scrap_tablet(&self, id: TabletId) -> TesselResult<()> {
        let keyspace = self.keyspace_of_tablet(id)?;
        self.with_keyspace(&keyspace, |state| {
            let tablet = state.tablets.get_mut(&id).ok_or_else(|| {
                TesselError::Precondition(format!("{id} does not exist"))
            })?;
            tablet.scrap();
            let range = tablet.key_range.clone();
            let shard = state.shard_mut(&range)?;
            shard.tablets.remove(&id);
            if shard.master == Some(id) {
                shard.master = None;
            }
            tracing::info!(keyspace = %keyspace, shard = %range, tablet = %id, "tablet scrapped");
            Ok(())
        })
    }

    /// Recompute and publish the serving graph for every cell of `keyspace`.
    pub fn rebuild_graph(&self, keyspace: &str) -> TesselResult<()> {
        self.with_keyspace(keyspace, |state| {
            state.rebuild_all_cells().map_err(|e| {
                e.log_if_consistency();
                e
            })
        })
    }

    /// The published serving graph for one cell, in its stable text form.
    pub fn serving_graph_text(&self, keyspace: &str, cell: &str) -> TesselResult<String> {
        self.with_keyspace(keyspace, |state| {
            state
                .graphs
                .get(cell)
                .map(|g| g.render())
                .ok_or_else(|| {
                    TesselError::Precondition(format!(
                        "no serving graph published for {keyspace} in cell {cell}"
                    ))
                })
        })
    }

    /// Remove one cell from a shard. Fails while the shard still serves any
    /// role, or still has active tablets, in that cell.
    pub fn remove_shard_from_cell(
        &self,
        keyspace: &str,
        range: &KeyRange,
        cell: &str,
    ) -> TesselResult<()> {
        self.with_keyspace(keyspace, |state| {
            let shard = state.shard(range)?;
            if shard.serves_any_in_cell(cell) {
                return Err(TesselError::Precondition(format!(
                    "shard {keyspace}/{range} still serves {:?} in cell {cell}",
                    shard
                        .served_types_in_cell(cell)
                        .iter()
                        .map(|t| t.to_string())
                        .collect::<Vec<_>>(),
                )));
            }
            let active: Vec<TabletId> = shard
                .tablets
                .iter()
                .filter(|id| {
                    state
                        .tablets
                        .get(id)
                        .is_some_and(|t| t.cell == cell && !t.is_scrapped())
                })
                .copied()
                .collect();
            if !active.is_empty() {
                return Err(TesselError::Precondition(format!(
                    "shard {keyspace}/{range} still has active tablets in cell {cell}: {active:?}"
                )));
            }
            state.shard_mut(range)?.remove_cell(cell);
            state
                .tablets
                .retain(|_, t| !(t.key_range == *range && t.cell == cell && t.is_scrapped()));
            tracing::info!(keyspace = keyspace, shard = %range, cell = cell, "cell removed from shard");
            Ok(())
        })
    }

    /// Delete a retired shard. Fails while any cell still references it or
    /// any child still lists it as a replication source.
    pub fn delete_shard(&self, keyspace: &str, range: &KeyRange) -> TesselResult<()> {
        self.with_keyspace(keyspace, |state| {
            let shard = state.shard(range)?;
            if !shard.cells.is_empty() {
                return Err(TesselError::Precondition(format!(
                    "shard {keyspace}/{range} is still referenced by cells {:?}",
                    shard.cells,
                )));
            }
            let children = state.children_of(range);
            if !children.is_empty() {
                return Err(TesselError::Precondition(format!(
                    "shard {keyspace}/{range} is still a replication source for {:?}",
                    children.iter().map(|r| r.to_string()).collect::<Vec<_>>(),
                )));
            }
            state.shards.remove(range);
            state.tablets.retain(|_, t| t.key_range != *range);
            tracing::info!(keyspace = keyspace, shard = %range, "shard deleted");
            Ok(())
        })
    }

    /// The `GetShard` record.
    pub fn get_shard(&self, keyspace: &str, range: &KeyRange) -> TesselResult<ShardRecord> {
        self.with_keyspace(keyspace, |state| Ok(state.shard(range)?.record()))
    }

    fn keyspace_of_tablet(&self, id: TabletId) -> TesselResult<String> {
        for entry in self.keyspaces.iter() {
            if entry.value().lock().tablets.contains_key(&id) {
                return Ok(entry.key().clone());
            }
        }
        Err(TesselError::Precondition(format!("{id} does not exist")))
    }
}
