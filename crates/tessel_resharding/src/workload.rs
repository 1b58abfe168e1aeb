//! Background load generation and lag monitoring.
//!
//! Used by tests and operators to exercise a split under live writes: the
//! insert loop keeps updating a timestamp row on the source shard, and the
//! lag monitor samples the same row on a destination and aggregates how far
//! behind filtered replication is running. Both are explicit cancellable
//! runners that report their statistics on join, not ambient flags.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tessel_common::{KeyspaceId, StopSignal, TesselError, TesselResult};
use tessel_tablet::{ChangeOp, Row, RowChange, ShardEngine};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Continuous writer: inserts a timestamp row, then keeps bumping it.
pub struct InsertLoad;

/// Handle to a running insert loop.
pub struct InsertLoadHandle {
    stop: StopSignal,
    writes: Arc<AtomicU64>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl InsertLoad {
    /// Insert `(row_id, now, keyspace_id)` into `table` on `engine`, then
    /// update the timestamp every `interval` until stopped.
    pub fn start(
        engine: Arc<ShardEngine>,
        table: &str,
        row_id: u64,
        keyspace_id: KeyspaceId,
        interval: Duration,
    ) -> TesselResult<InsertLoadHandle> {
        let table = table.to_string();
        engine.execute_txn(vec![RowChange {
            op: ChangeOp::Insert,
            table: table.clone(),
            row: Row::new(row_id, now_ms().to_string(), keyspace_id.clone()),
        }])?;

        let stop = StopSignal::new();
        let writes = Arc::new(AtomicU64::new(1));
        let stop_clone = stop.clone();
        let writes_clone = writes.clone();
        let join = std::thread::Builder::new()
            .name(format!("tessel-insert-{row_id}"))
            .spawn(move || {
                while !stop_clone.wait_timeout(interval) {
                    let change = RowChange {
                        op: ChangeOp::Update,
                        table: table.clone(),
                        row: Row::new(row_id, now_ms().to_string(), keyspace_id.clone()),
                    };
                    match engine.execute_txn(vec![change]) {
                        Ok(_) => {
                            writes_clone.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) if e.is_transient() => {
                            tracing::warn!(row_id, error = %e, "insert load write rejected");
                        }
                        Err(e) => {
                            tracing::error!(row_id, error = %e, "insert load stopping on error");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| TesselError::Internal(format!("failed to spawn insert load: {e}")))?;

        Ok(InsertLoadHandle {
            stop,
            writes,
            join: Some(join),
        })
    }
}

impl InsertLoadHandle {
    /// Stop the loop and return how many writes it committed.
    pub fn stop_and_join(mut self) -> u64 {
        self.stop.trigger();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        self.writes.load(Ordering::Relaxed)
    }
}

impl Drop for InsertLoadHandle {
    fn drop(&mut self) {
        self.stop.trigger();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Aggregated lag statistics reported when a monitor is joined.
#[derive(Debug, Clone, Copy, Default)]
pub struct LagStats {
    pub max_lag_ms: u64,
    pub avg_lag_ms: u64,
    pub samples: u64,
}

/// Samples a replicated timestamp row and tracks replication delay.
pub struct LagMonitor;

/// Handle to a running lag monitor.
pub struct LagMonitorHandle {
    stop: StopSignal,
    max_lag: Arc<AtomicU64>,
    lag_sum: Arc<AtomicU64>,
    samples: Arc<AtomicU64>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl LagMonitor {
    /// Read `table:row_id` on `engine` every `interval`, comparing the row's
    /// timestamp to the clock.
    pub fn start(
        engine: Arc<ShardEngine>,
        table: &str,
        row_id: u64,
        interval: Duration,
    ) -> TesselResult<LagMonitorHandle> {
        let table = table.to_string();
        let stop = StopSignal::new();
        let max_lag = Arc::new(AtomicU64::new(0));
        let lag_sum = Arc::new(AtomicU64::new(0));
        let samples = Arc::new(AtomicU64::new(0));

        let stop_clone = stop.clone();
        let max_clone = max_lag.clone();
        let sum_clone = lag_sum.clone();
        let samples_clone = samples.clone();
        let join = std::thread::Builder::new()
            .name(format!("tessel-lagmon-{row_id}"))
            .spawn(move || {
                loop {
                    if let Some(row) = engine.store().get(&table, row_id) {
                        if let Ok(written_ms) = row.msg.parse::<u64>() {
                            let lag = now_ms().saturating_sub(written_ms);
                            tracing::debug!(row_id, lag_ms = lag, "lag sample");
                            samples_clone.fetch_add(1, Ordering::Relaxed);
                            sum_clone.fetch_add(lag, Ordering::Relaxed);
                            max_clone.fetch_max(lag, Ordering::Relaxed);
                        }
                    }
                    if stop_clone.wait_timeout(interval) {
                        break;
                    }
                }
            })
            .map_err(|e| TesselError::Internal(format!("failed to spawn lag monitor: {e}")))?;

        Ok(LagMonitorHandle {
            stop,
            max_lag,
            lag_sum,
            samples,
            join: Some(join),
        })
    }
}

impl LagMonitorHandle {
    /// Stop sampling and report the aggregated statistics.
    pub fn stop_and_join(mut self) -> LagStats {
        self.stop.trigger();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        let samples = self.samples.load(Ordering::Relaxed);
        LagStats {
            max_lag_ms: self.max_lag.load(Ordering::Relaxed),
            avg_lag_ms: if samples == 0 {
                0
            } else {
                self.lag_sum.load(Ordering::Relaxed) / samples
            },
            samples,
        }
    }
}

impl Drop for LagMonitorHandle {
    fn drop(&mut self) {
        self.stop.trigger();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
