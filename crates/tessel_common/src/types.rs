//! Core id newtypes and tablet role/lifecycle enums.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TesselError;

/// Identifier of one storage-node replica (tablet).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TabletId(pub u32);

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tablet-{:010}", self.0)
    }
}

/// Role of a tablet within its shard.
///
/// `Master`, `Replica` and `Rdonly` are serving roles and appear in the
/// serving graph; `Spare` is a warm standby and `Scrap` a decommissioned
/// tablet, neither is routable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TabletType {
    Master,
    Replica,
    Rdonly,
    Spare,
    Scrap,
}

impl TabletType {
    /// True for roles that take routed traffic.
    pub fn is_serving(&self) -> bool {
        matches!(self, TabletType::Master | TabletType::Replica | TabletType::Rdonly)
    }

    /// The serving roles in stable render order.
    pub const SERVING: [TabletType; 3] =
        [TabletType::Master, TabletType::Rdonly, TabletType::Replica];
}

impl fmt::Display for TabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TabletType::Master => "master",
            TabletType::Replica => "replica",
            TabletType::Rdonly => "rdonly",
            TabletType::Spare => "spare",
            TabletType::Scrap => "scrap",
        };
        f.write_str(s)
    }
}

impl FromStr for TabletType {
    type Err = TesselError;

    fn from_str(s: &str) -> Result<Self, TesselError> {
        match s {
            "master" => Ok(TabletType::Master),
            "replica" => Ok(TabletType::Replica),
            "rdonly" => Ok(TabletType::Rdonly),
            "spare" => Ok(TabletType::Spare),
            "scrap" => Ok(TabletType::Scrap),
            other => Err(TesselError::Config(format!("unknown tablet type {other:?}"))),
        }
    }
}

/// Lifecycle state of a tablet: `Init → Serving|NotServing → Scrapped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabletState {
    Init,
    Serving,
    NotServing,
    Scrapped,
}

impl fmt::Display for TabletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TabletState::Init => "init",
            TabletState::Serving => "serving",
            TabletState::NotServing => "not_serving",
            TabletState::Scrapped => "scrapped",
        };
        f.write_str(s)
    }
}

/// Type of the sharding key for a keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyspaceIdType {
    /// Fixed-width unsigned integer, packed big-endian.
    Uint64,
    /// Opaque byte string.
    Bytes,
}

impl fmt::Display for KeyspaceIdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyspaceIdType::Uint64 => f.write_str("uint64"),
            KeyspaceIdType::Bytes => f.write_str("bytes"),
        }
    }
}

impl FromStr for KeyspaceIdType {
    type Err = TesselError;

    fn from_str(s: &str) -> Result<Self, TesselError> {
        match s {
            "uint64" => Ok(KeyspaceIdType::Uint64),
            "bytes" => Ok(KeyspaceIdType::Bytes),
            other => Err(TesselError::Config(format!(
                "unknown keyspace id type {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tablet_type_round_trip() {
        for t in [
            TabletType::Master,
            TabletType::Replica,
            TabletType::Rdonly,
            TabletType::Spare,
            TabletType::Scrap,
        ] {
            assert_eq!(t.to_string().parse::<TabletType>().unwrap(), t);
        }
        assert!("mayor".parse::<TabletType>().is_err());
    }

    #[test]
    fn test_serving_roles() {
        assert!(TabletType::Master.is_serving());
        assert!(TabletType::Replica.is_serving());
        assert!(TabletType::Rdonly.is_serving());
        assert!(!TabletType::Spare.is_serving());
        assert!(!TabletType::Scrap.is_serving());
    }

    #[test]
    fn test_keyspace_id_type_parse() {
        assert_eq!(
            "uint64".parse::<KeyspaceIdType>().unwrap(),
            KeyspaceIdType::Uint64
        );
        assert_eq!(
            "bytes".parse::<KeyspaceIdType>().unwrap(),
            KeyspaceIdType::Bytes
        );
        assert!("varchar".parse::<KeyspaceIdType>().is_err());
    }
}
