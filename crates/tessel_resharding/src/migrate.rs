//! Served-type migration: the reversible cutover state machine.
//!
//! Per (key range, tablet type) the state runs
//! `NotMigrated → Migrating → Migrated`, with the symmetric reverse while
//! the parent's source relationship still exists. A transition atomically
//! flips the served types on the parent and its children under the keyspace
//! lock, then rebuilds the serving graph; if the rebuild fails the shards
//! are rolled back and nothing is published.
//!
//! Master is always the last role moved: the cutover refuses to run until
//! every non-master role is migrated and the destinations' players have
//! drained to near-zero lag, checked explicitly against player metrics,
//! never inferred. After the master moves, the children's players are
//! stopped, their checkpoints discarded, and the source links cleared.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use tessel_common::{KeyRange, MigrateConfig, TabletType, TesselError, TesselResult};
use tessel_topo::{Shard, TopoRegistry};

use crate::player::PlayerRegistry;

/// Migration progress for one (key range, tablet type) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    NotMigrated,
    Migrating,
    Migrated,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationState::NotMigrated => f.write_str("not_migrated"),
            MigrationState::Migrating => f.write_str("migrating"),
            MigrationState::Migrated => f.write_str("migrated"),
        }
    }
}

type PairKey = (String, KeyRange, TabletType);

/// Linearizes served-type transitions: no two concurrent transitions for
/// the same (key range, tablet type) pair can both succeed.
#[derive(Default)]
pub struct MigrationCoordinator {
    states: Mutex<HashMap<PairKey, MigrationState>>,
}

impl MigrationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, keyspace: &str, range: &KeyRange, tablet_type: TabletType) -> MigrationState {
        self.states
            .lock()
            .get(&(keyspace.to_string(), range.clone(), tablet_type))
            .copied()
            .unwrap_or(MigrationState::NotMigrated)
    }

    /// Move serving of `tablet_type` for `parent`'s range from the parent to
    /// its children (or back with `reverse`).
    pub fn migrate_served_type(
        &self,
        topo: &TopoRegistry,
        players: &PlayerRegistry,
        keyspace: &str,
        parent: &KeyRange,
        tablet_type: TabletType,
        reverse: bool,
        config: &MigrateConfig,
    ) -> TesselResult<()> {
        if !tablet_type.is_serving() {
            return Err(TesselError::Config(format!(
                "{tablet_type} is not a served type"
            )));
        }
        let key: PairKey = (keyspace.to_string(), parent.clone(), tablet_type);
        let prev = {
            let mut states = self.states.lock();
            let current = states
                .get(&key)
                .copied()
                .unwrap_or(MigrationState::NotMigrated);
            match (reverse, current) {
                (_, MigrationState::Migrating) => {
                    return Err(TesselError::Conflict(format!(
                        "a migration of {keyspace}/{parent} {tablet_type} is already in progress"
                    )))
                }
                (false, MigrationState::Migrated) => {
                    return Err(TesselError::Precondition(format!(
                        "{keyspace}/{parent} {tablet_type} is already migrated"
                    )))
                }
                (true, MigrationState::NotMigrated) => {
                    return Err(TesselError::Precondition(format!(
                        "{keyspace}/{parent} {tablet_type} is not migrated, nothing to reverse"
                    )))
                }
                _ => {}
            }
            states.insert(key.clone(), MigrationState::Migrating);
            current
        };

        let result =
            self.do_migrate(topo, players, keyspace, parent, tablet_type, reverse, config);
        let mut states = self.states.lock();
        match &result {
            Ok(()) => states.insert(
                key,
                if reverse {
                    MigrationState::NotMigrated
                } else {
                    MigrationState::Migrated
                },
            ),
            Err(_) => states.insert(key, prev),
        };
        result
    }

    fn do_migrate(
        &self,
        topo: &TopoRegistry,
        players: &PlayerRegistry,
        keyspace: &str,
        parent: &KeyRange,
        tablet_type: TabletType,
        reverse: bool,
        config: &MigrateConfig,
    ) -> TesselResult<()> {
        let children = topo.with_keyspace(keyspace, |state| {
            if state.shards.get(parent).is_none() {
                return Err(if reverse {
                    TesselError::Irreversible(format!(
                        "parent shard {keyspace}/{parent} no longer exists"
                    ))
                } else {
                    TesselError::Precondition(format!(
                        "shard {keyspace}/{parent} does not exist"
                    ))
                });
            }
            Ok(state.children_of(parent))
        })?;
        if children.is_empty() {
            return Err(if reverse {
                TesselError::Irreversible(format!(
                    "no shard lists {keyspace}/{parent} as a source any more, reverse is unavailable"
                ))
            } else {
                TesselError::Precondition(format!(
                    "no child shard is importing from {keyspace}/{parent}"
                ))
            });
        }

        if tablet_type == TabletType::Master && !reverse {
            self.require_non_master_migrated(keyspace, parent)?;
            self.require_players_drained(players, keyspace, &children, config)?;
        }

        topo.with_keyspace(keyspace, |state| {
            let mut saved: Vec<Shard> = Vec::with_capacity(children.len() + 1);
            for range in std::iter::once(parent).chain(children.iter()) {
                saved.push(state.shard(range)?.clone());
            }

            let cells = if !reverse {
                let shard = state.shard(parent)?;
                shard
                    .cells
                    .iter()
                    .filter(|c| shard.serves(c, tablet_type))
                    .cloned()
                    .collect::<BTreeSet<String>>()
            } else {
                let mut cells = BTreeSet::new();
                for child in &children {
                    let shard = state.shard(child)?;
                    for cell in &shard.cells {
                        if shard.serves(cell, tablet_type) {
                            cells.insert(cell.clone());
                        }
                    }
                }
                cells
            };
            if cells.is_empty() {
                return Err(TesselError::Precondition(format!(
                    "{} does not serve {tablet_type} in any cell",
                    if reverse { "destination" } else { "source" },
                )));
            }

            for cell in &cells {
                if !reverse {
                    state.shard_mut(parent)?.remove_served_type(cell, tablet_type);
                    for child in &children {
                        state.shard_mut(child)?.add_served_type(cell, tablet_type);
                    }
                } else {
                    state.shard_mut(parent)?.add_served_type(cell, tablet_type);
                    for child in &children {
                        state.shard_mut(child)?.remove_served_type(cell, tablet_type);
                    }
                }
            }

            if let Err(e) = state.rebuild_all_cells() {
                // no partial partitions are ever published
                for shard in saved {
                    state.shards.insert(shard.key_range.clone(), shard);
                }
                e.log_if_consistency();
                return Err(e);
            }
            Ok(())
        })?;

        if tablet_type == TabletType::Master && !reverse {
            // last role moved: end the streams, then cut the source links
            for child in &children {
                players.stop_shard_players(keyspace, child);
            }
            topo.with_keyspace(keyspace, |state| {
                for child in &children {
                    state
                        .shard_mut(child)?
                        .source_shards
                        .retain(|r| r != parent);
                }
                Ok(())
            })?;
        }

        tracing::info!(
            keyspace = keyspace,
            shard = %parent,
            tablet_type = %tablet_type,
            reverse = reverse,
            children = children.len(),
            "served type migrated",
        );
        Ok(())
    }

    fn require_non_master_migrated(&self, keyspace: &str, parent: &KeyRange) -> TesselResult<()> {
        for other in [TabletType::Rdonly, TabletType::Replica] {
            if self.state(keyspace, parent, other) != MigrationState::Migrated {
                return Err(TesselError::Precondition(format!(
                    "cannot migrate master for {keyspace}/{parent}: {other} is not migrated yet"
                )));
            }
        }
        Ok(())
    }

    fn require_players_drained(
        &self,
        players: &PlayerRegistry,
        keyspace: &str,
        children: &[KeyRange],
        config: &MigrateConfig,
    ) -> TesselResult<()> {
        let deadline = Instant::now() + config.drain_timeout;
        loop {
            for child in children {
                if players.any_failed(keyspace, child) {
                    return Err(TesselError::Precondition(format!(
                        "a binlog player for {keyspace}/{child} has failed; run a fresh snapshot cycle"
                    )));
                }
            }
            let worst = children
                .iter()
                .map(|c| players.max_lag(keyspace, c))
                .max()
                .unwrap_or(0);
            if worst <= config.max_master_lag_events {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TesselError::Precondition(format!(
                    "destination players not drained: lag {worst} events exceeds {} after {:?}",
                    config.max_master_lag_events, config.drain_timeout,
                )));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
