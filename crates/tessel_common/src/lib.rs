//! Shared foundation for the tessel resharding orchestrator: error taxonomy,
//! key-range arithmetic, id newtypes, configuration, and the cooperative stop
//! signal used by every background runner.

pub mod config;
pub mod error;
pub mod keyrange;
pub mod stop;
pub mod types;

pub use config::{ConvergenceConfig, DiffConfig, MigrateConfig, PlayerConfig, ReshardingConfig};
pub use error::{ErrorContext, ErrorKind, TesselError, TesselResult};
pub use keyrange::{KeyRange, KeyspaceId};
pub use stop::StopSignal;
pub use types::{KeyspaceIdType, TabletId, TabletState, TabletType};
