//! Operator-tunable configuration for the resharding flow.
//!
//! The convergence thresholds encode that filtered replication is
//! near-real-time but not synchronous: most of a burst is expected quickly,
//! the remainder within a longer bound. They are tuning values, not protocol
//! guarantees, so they live here rather than as constants.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for one resharding deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReshardingConfig {
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub diff: DiffConfig,
    #[serde(default)]
    pub migrate: MigrateConfig,
    #[serde(default)]
    pub convergence: ConvergenceConfig,
}

/// Binlog player (filtered replication streamer) knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Maximum change-log transactions read per batch.
    pub batch_size: usize,
    /// Poll interval while the source change log has no new events.
    #[serde(with = "duration_ms", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    /// Initial backoff after a transient destination error (doubles per
    /// consecutive failure).
    #[serde(with = "duration_ms", rename = "initial_backoff_ms")]
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    #[serde(with = "duration_ms", rename = "max_backoff_ms")]
    pub max_backoff: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            poll_interval: Duration::from_millis(20),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Split-diff checker knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffConfig {
    /// How long to let live replication settle before re-checking a
    /// first-pass discrepancy. Bounded staleness is acceptable; a mismatch
    /// that survives the re-check is not.
    #[serde(with = "duration_ms", rename = "settle_ms")]
    pub settle: Duration,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(1),
        }
    }
}

/// Served-type migration knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateConfig {
    /// Maximum change-log events a destination player may still be behind
    /// for the master cutover precondition to pass.
    pub max_master_lag_events: u64,
    /// How long the master cutover will wait for players to drain below
    /// `max_master_lag_events` before failing the precondition.
    #[serde(with = "duration_ms", rename = "drain_timeout_ms")]
    pub drain_timeout: Duration,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            max_master_lag_events: 0,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Bounds on how fast filtered replication must converge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// Fraction of freshly inserted rows expected on the correct destination
    /// within `quick_timeout`.
    pub quick_fraction: f64,
    #[serde(with = "duration_ms", rename = "quick_timeout_ms")]
    pub quick_timeout: Duration,
    /// All rows must be present within this bound.
    #[serde(with = "duration_ms", rename = "full_timeout_ms")]
    pub full_timeout: Duration,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            quick_fraction: 0.8,
            quick_timeout: Duration::from_secs(5),
            full_timeout: Duration::from_secs(20),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ReshardingConfig::default();
        assert_eq!(cfg.convergence.quick_fraction, 0.8);
        assert_eq!(cfg.convergence.quick_timeout, Duration::from_secs(5));
        assert_eq!(cfg.convergence.full_timeout, Duration::from_secs(20));
        assert_eq!(cfg.migrate.max_master_lag_events, 0);
        assert!(cfg.player.batch_size > 0);
    }

    #[test]
    fn test_serde_round_trip_with_ms_fields() {
        let cfg = ReshardingConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"quick_timeout_ms\":5000"));
        let back: ReshardingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.player.poll_interval, cfg.player.poll_interval);
        assert_eq!(back.diff.settle, cfg.diff.settle);
    }
}
