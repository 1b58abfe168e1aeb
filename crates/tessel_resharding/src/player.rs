//! Filtered replication: the binlog player.
//!
//! One player per (destination shard, source shard) pair tails the source's
//! change log from the destination's checkpoint, applies the transactions
//! whose rows fall in the destination's key range, and advances the
//! checkpoint with every applied batch. It runs until explicitly stopped:
//! transient destination errors are retried with exponential backoff
//! indefinitely, while a corrupt checkpoint parks the player in a failed
//! state that only a fresh snapshot/restore cycle clears.
//!
//! Stopping is cooperative: the player finishes the batch it is applying,
//! leaves the checkpoint consistent with the applied data, and exits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use tessel_common::{KeyRange, PlayerConfig, StopSignal, TesselError, TesselResult};
use tessel_tablet::ShardEngine;

/// Live counters for one player.
#[derive(Debug, Default)]
pub struct PlayerMetrics {
    statements_applied: AtomicU64,
    transactions_applied: AtomicU64,
    last_position: AtomicU64,
    retries: AtomicU64,
    failed: AtomicBool,
}

impl PlayerMetrics {
    pub fn snapshot(&self) -> PlayerMetricsSnapshot {
        PlayerMetricsSnapshot {
            statements_applied: self.statements_applied.load(Ordering::Relaxed),
            transactions_applied: self.transactions_applied.load(Ordering::Relaxed),
            last_position: self.last_position.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a player's counters.
#[derive(Debug, Clone)]
pub struct PlayerMetricsSnapshot {
    pub statements_applied: u64,
    pub transactions_applied: u64,
    /// Last source change-log position the checkpoint covers.
    pub last_position: u64,
    pub retries: u64,
    pub failed: bool,
}

/// A binlog player, ready to start. The destination must already hold a
/// checkpoint row for the source shard (written by restore).
pub struct BinlogPlayer {
    source: Arc<ShardEngine>,
    dest: Arc<ShardEngine>,
    config: PlayerConfig,
}

impl BinlogPlayer {
    pub fn new(source: Arc<ShardEngine>, dest: Arc<ShardEngine>, config: PlayerConfig) -> Self {
        Self {
            source,
            dest,
            config,
        }
    }

    /// Validate the resume point and start the streaming loop on a named
    /// thread. The destination's player gauge counts the running player.
    pub fn start(self) -> TesselResult<PlayerHandle> {
        let source_range = self.source.key_range().clone();
        let from = self
            .dest
            .checkpoints()
            .get(&source_range)
            .ok_or_else(|| {
                TesselError::StreamCorruption(format!(
                    "destination {} has no checkpoint for source {}, restore first",
                    self.dest.key_range(),
                    source_range,
                ))
            })?;
        let current = self.source.binlog().current_position();
        if from > current {
            return Err(TesselError::StreamCorruption(format!(
                "checkpoint {from} for source {source_range} is ahead of its change log ({current})"
            )));
        }

        let stop = StopSignal::new();
        let metrics = Arc::new(PlayerMetrics::default());
        metrics.last_position.store(from, Ordering::SeqCst);
        self.dest.inc_players();

        let thread_name = format!("tessel-player-{}", self.dest.key_range());
        let stop_clone = stop.clone();
        let metrics_clone = metrics.clone();
        let source = self.source.clone();
        let dest = self.dest.clone();
        let config = self.config.clone();
        let join = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                run_loop(&source, &dest, &config, &stop_clone, &metrics_clone);
                dest.dec_players();
            })
            .map_err(|e| {
                self.dest.dec_players();
                TesselError::Internal(format!("failed to spawn player thread: {e}"))
            })?;

        tracing::info!(
            source = %self.source.key_range(),
            dest = %self.dest.key_range(),
            from = from,
            "binlog player started",
        );
        Ok(PlayerHandle {
            stop,
            metrics,
            source: self.source,
            dest: self.dest,
            join: Some(join),
        })
    }
}

fn run_loop(
    source: &ShardEngine,
    dest: &ShardEngine,
    config: &PlayerConfig,
    stop: &StopSignal,
    metrics: &PlayerMetrics,
) {
    let source_range = source.key_range().clone();
    let dest_range = dest.key_range().clone();
    let mut backoff = config.initial_backoff;

    'outer: while !stop.is_triggered() {
        let from = metrics.last_position.load(Ordering::SeqCst);
        let batch = match source
            .binlog()
            .stream_filtered(from, &dest_range, config.batch_size)
        {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(
                    source = %source_range,
                    dest = %dest_range,
                    error = %e,
                    "change log read failed, player parked until a fresh snapshot cycle",
                );
                metrics.failed.store(true, Ordering::SeqCst);
                break;
            }
        };

        if batch.events.is_empty() && batch.through == from {
            // caught up, wait for new source transactions
            if stop.wait_timeout(config.poll_interval) {
                break;
            }
            continue;
        }

        for event in &batch.events {
            loop {
                match dest.apply_replicated(&event.changes, &source_range, event.pos) {
                    Ok(()) => {
                        backoff = config.initial_backoff;
                        metrics
                            .statements_applied
                            .fetch_add(event.changes.len() as u64, Ordering::Relaxed);
                        metrics.transactions_applied.fetch_add(1, Ordering::Relaxed);
                        metrics.last_position.store(event.pos, Ordering::SeqCst);
                        break;
                    }
                    Err(e) if e.is_transient() => {
                        metrics.retries.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            dest = %dest_range,
                            pos = event.pos,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "transient apply failure, backing off",
                        );
                        if stop.wait_timeout(backoff) {
                            break 'outer;
                        }
                        backoff = (backoff * 2).min(config.max_backoff);
                    }
                    Err(e) => {
                        tracing::error!(
                            dest = %dest_range,
                            pos = event.pos,
                            error = %e,
                            "apply failed fatally, player parked",
                        );
                        metrics.failed.store(true, Ordering::SeqCst);
                        break 'outer;
                    }
                }
            }
        }

        // advance the checkpoint over trailing transactions that filtered
        // to nothing for this destination
        if batch.through > metrics.last_position.load(Ordering::SeqCst) {
            if let Err(e) = dest.advance_checkpoint(&source_range, batch.through) {
                tracing::error!(dest = %dest_range, error = %e, "checkpoint advance failed");
                metrics.failed.store(true, Ordering::SeqCst);
                break;
            }
            metrics.last_position.store(batch.through, Ordering::SeqCst);
        }
    }

    tracing::info!(
        source = %source_range,
        dest = %dest_range,
        position = metrics.last_position.load(Ordering::SeqCst),
        "binlog player stopped",
    );
}

/// Handle to a running player.
pub struct PlayerHandle {
    stop: StopSignal,
    metrics: Arc<PlayerMetrics>,
    source: Arc<ShardEngine>,
    dest: Arc<ShardEngine>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl std::fmt::Debug for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerHandle")
            .field("metrics", &self.metrics)
            .field("join", &self.join)
            .finish_non_exhaustive()
    }
}

impl PlayerHandle {
    pub fn metrics(&self) -> PlayerMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn source_range(&self) -> &KeyRange {
        self.source.key_range()
    }

    /// Source transactions not yet covered by the checkpoint.
    pub fn lag(&self) -> u64 {
        self.source
            .binlog()
            .current_position()
            .saturating_sub(self.metrics.last_position.load(Ordering::SeqCst))
    }

    pub fn is_failed(&self) -> bool {
        self.metrics.failed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Request a cooperative stop and wait for the player to exit.
    pub fn stop_and_join(&mut self) {
        self.stop.trigger();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    /// Discard this player's checkpoint row on the destination. Only valid
    /// after the player has stopped.
    fn discard_checkpoint(&self) {
        self.dest.checkpoints().discard(self.source.key_range());
    }
}

impl Drop for PlayerHandle {
    fn drop(&mut self) {
        self.stop.trigger();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// All players of one deployment, keyed by (keyspace, destination range).
/// The per-destination count is externally observable through the engine
/// gauge and must reach zero exactly when the destination's source list is
/// cleared.
#[derive(Default)]
pub struct PlayerRegistry {
    players: Mutex<HashMap<(String, KeyRange), Vec<PlayerHandle>>>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_player(
        &self,
        keyspace: &str,
        source: Arc<ShardEngine>,
        dest: Arc<ShardEngine>,
        config: PlayerConfig,
    ) -> TesselResult<()> {
        let key = (keyspace.to_string(), dest.key_range().clone());
        let handle = BinlogPlayer::new(source, dest, config).start()?;
        self.players.lock().entry(key).or_default().push(handle);
        Ok(())
    }

    pub fn player_count(&self, keyspace: &str, dest: &KeyRange) -> usize {
        self.players
            .lock()
            .get(&(keyspace.to_string(), dest.clone()))
            .map_or(0, |handles| {
                handles.iter().filter(|h| h.is_running()).count()
            })
    }

    /// Worst checkpoint lag across a destination's players.
    pub fn max_lag(&self, keyspace: &str, dest: &KeyRange) -> u64 {
        self.players
            .lock()
            .get(&(keyspace.to_string(), dest.clone()))
            .map_or(0, |handles| handles.iter().map(|h| h.lag()).max().unwrap_or(0))
    }

    pub fn any_failed(&self, keyspace: &str, dest: &KeyRange) -> bool {
        self.players
            .lock()
            .get(&(keyspace.to_string(), dest.clone()))
            .is_some_and(|handles| handles.iter().any(|h| h.is_failed()))
    }

    /// Cooperatively stop every player of a destination shard and discard
    /// their checkpoints. Called when the last served type has migrated.
    pub fn stop_shard_players(&self, keyspace: &str, dest: &KeyRange) {
        let removed = self
            .players
            .lock()
            .remove(&(keyspace.to_string(), dest.clone()));
        if let Some(mut handles) = removed {
            for handle in &mut handles {
                handle.stop_and_join();
                handle.discard_checkpoint();
            }
            tracing::info!(
                keyspace = keyspace,
                dest = %dest,
                players = handles.len(),
                "destination players stopped, checkpoints discarded",
            );
        }
    }
}
