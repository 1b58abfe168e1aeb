//! Per-cell serving graph: the published routing table.
//!
//! Rebuilt on demand from all shards' served types. For every role present,
//! the serving key ranges must tile the full key space exactly; a gap or
//! overlap is a fatal consistency error and the previous graph stays
//! published.

use std::collections::BTreeMap;

use tessel_common::{KeyRange, TabletType, TesselError, TesselResult};

use crate::shard::Shard;

/// The routing table for one cell: role → ordered serving key ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellGraph {
    partitions: BTreeMap<TabletType, Vec<KeyRange>>,
}

impl CellGraph {
    /// Compute the graph for `cell` from the shard set, validating that each
    /// role's ranges tile the full key space.
    pub fn rebuild<'a>(
        cell: &str,
        shards: impl Iterator<Item = &'a Shard> + Clone,
    ) -> TesselResult<CellGraph> {
        let mut partitions = BTreeMap::new();
        for tablet_type in TabletType::SERVING {
            let mut ranges: Vec<KeyRange> = shards
                .clone()
                .filter(|s| s.serves(cell, tablet_type))
                .map(|s| s.key_range.clone())
                .collect();
            if ranges.is_empty() {
                continue;
            }
            ranges.sort_by(|a, b| a.start().cmp(b.start()));
            if !KeyRange::tiles_full_space(&ranges) {
                return Err(TesselError::Consistency(format!(
                    "serving ranges for {tablet_type} in cell {cell} do not tile the key space: {}",
                    render_ranges(&ranges),
                )));
            }
            partitions.insert(tablet_type, ranges);
        }
        Ok(CellGraph { partitions })
    }

    /// Ordered serving ranges for a role, if the role is served at all.
    pub fn partition(&self, tablet_type: TabletType) -> Option<&[KeyRange]> {
        self.partitions.get(&tablet_type).map(|v| v.as_slice())
    }

    pub fn tablet_types(&self) -> Vec<TabletType> {
        TabletType::SERVING
            .iter()
            .filter(|t| self.partitions.contains_key(t))
            .copied()
            .collect()
    }

    /// Stable textual form consumed by operators and tests:
    ///
    /// ```text
    /// Partitions(master): -80 80-
    /// Partitions(rdonly): -80 80-c0 c0-
    /// Partitions(replica): -80 80-
    /// TabletTypes: master,rdonly,replica
    /// ```
    pub fn render(&self) -> String {
        let mut out = String::new();
        for tablet_type in TabletType::SERVING {
            if let Some(ranges) = self.partitions.get(&tablet_type) {
                out.push_str(&format!(
                    "Partitions({tablet_type}): {}\n",
                    render_ranges(ranges)
                ));
            }
        }
        let types: Vec<String> = self.tablet_types().iter().map(|t| t.to_string()).collect();
        out.push_str(&format!("TabletTypes: {}", types.join(",")));
        out
    }
}

fn render_ranges(ranges: &[KeyRange]) -> String {
    ranges
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
