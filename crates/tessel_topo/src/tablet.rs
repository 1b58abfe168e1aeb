use serde::{Deserialize, Serialize};

use tessel_common::{KeyRange, TabletId, TabletState, TabletType};

/// One storage-node replica: a role, a lifecycle state, and the shard it
/// belongs to. At most one `Master` per shard, enforced by reparent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tablet {
    pub id: TabletId,
    pub cell: String,
    pub keyspace: String,
    pub key_range: KeyRange,
    pub tablet_type: TabletType,
    pub state: TabletState,
}

impl Tablet {
    pub fn new(
        id: TabletId,
        cell: impl Into<String>,
        keyspace: impl Into<String>,
        key_range: KeyRange,
        tablet_type: TabletType,
    ) -> Self {
        Self {
            id,
            cell: cell.into(),
            keyspace: keyspace.into(),
            key_range,
            tablet_type,
            state: TabletState::Init,
        }
    }

    pub fn is_scrapped(&self) -> bool {
        self.state == TabletState::Scrapped
    }

    /// Move to the serving/not-serving state implied by the current role.
    pub fn refresh_state(&mut self, shard_is_authoritative: bool) {
        if self.is_scrapped() {
            return;
        }
        self.state = if self.tablet_type.is_serving() && shard_is_authoritative {
            TabletState::Serving
        } else {
            TabletState::NotServing
        };
    }

    /// Decommission: non-serving, out of the shard's active set.
    pub fn scrap(&mut self) {
        self.tablet_type = TabletType::Scrap;
        self.state = TabletState::Scrapped;
    }
}
