//! Sink B: the target mutation batcher.
//!
//! Probe tasks enqueue sparse field updates; the batcher coalesces them per
//! target with field-level last-write-wins semantics and flushes to the
//! target store at the end of each tick, periodically, and on shutdown.
//! A failed flush keeps the updates for the next flush, merged *under* any
//! fields written since (newer writes still win).

use crate::config::Region;
use crate::core::ports::TargetStore;
use crate::core::shutdown::ShutdownSignal;
use crate::core::types::{fields, MutationUpdate, TargetStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Default)]
struct PendingState {
    updates: HashMap<String, HashMap<String, serde_json::Value>>,
}

/// Mutation batcher over the target store port.
pub struct MutationBatcher {
    store: Arc<dyn TargetStore>,
    state: Mutex<PendingState>,
    /// Serializes flushes; re-entrant attempts no-op.
    flush_gate: Mutex<()>,
    flush_interval: Duration,
    drain_retries: u32,
}

impl MutationBatcher {
    pub fn new(store: Arc<dyn TargetStore>, flush_interval_ms: u64, drain_retries: u32) -> Self {
        Self {
            store,
            state: Mutex::new(PendingState::default()),
            flush_gate: Mutex::new(()),
            flush_interval: Duration::from_millis(flush_interval_ms),
            drain_retries,
        }
    }

    /// Merge one update into the pending set. Later values win per field.
    pub async fn enqueue(&self, update: MutationUpdate) {
        if update.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        let entry = state.updates.entry(update.target_id).or_default();
        for (field, value) in update.fields {
            entry.insert(field, value);
        }
    }

    /// Status carried by the not-yet-flushed mutation for this target, if
    /// any. The scheduler prefers this over the stored status so that
    /// overlapping ticks across an unflushed mutation cannot double-alert.
    pub async fn pending_status(&self, target_id: &str) -> Option<TargetStatus> {
        let state = self.state.lock().await;
        state
            .updates
            .get(target_id)
            .and_then(|fields_map| fields_map.get(fields::STATUS))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Region carried by the pending mutation, if a reassignment is queued.
    pub async fn pending_region(&self, target_id: &str) -> Option<Region> {
        let state = self.state.lock().await;
        state
            .updates
            .get(target_id)
            .and_then(|fields_map| fields_map.get(fields::REGION))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.updates.len()
    }

    /// Flush every pending update. On store failure the snapshot is merged
    /// back under whatever was enqueued meanwhile and retried next flush.
    /// Returns the number of targets flushed.
    pub async fn flush(&self) -> usize {
        let Ok(_guard) = self.flush_gate.try_lock() else {
            return 0;
        };

        let snapshot: Vec<MutationUpdate> = {
            let mut state = self.state.lock().await;
            state
                .updates
                .drain()
                .map(|(target_id, fields_map)| MutationUpdate {
                    target_id,
                    fields: fields_map,
                })
                .collect()
        };

        if snapshot.is_empty() {
            return 0;
        }

        let count = snapshot.len();
        match self.store.apply_updates(snapshot.clone()).await {
            Ok(()) => {
                debug!(targets = count, "flushed mutation batch");
                count
            }
            Err(e) => {
                warn!(error = %e, targets = count, "mutation flush failed, retrying next flush");
                let mut state = self.state.lock().await;
                for update in snapshot {
                    let entry = state.updates.entry(update.target_id).or_default();
                    for (field, value) in update.fields {
                        // Fields written after the failed snapshot win.
                        entry.entry(field).or_insert(value);
                    }
                }
                0
            }
        }
    }

    /// Flush until empty or the retry budget is exhausted.
    pub async fn drain(&self) -> usize {
        for _ in 0..=self.drain_retries {
            self.flush().await;
            if self.pending_len().await == 0 {
                return 0;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.pending_len().await;
        if remaining > 0 {
            warn!(remaining, "mutation drain left updates behind");
        }
        remaining
    }

    /// Periodic background flush.
    pub async fn run(self: Arc<Self>, shutdown: Arc<ShutdownSignal>) {
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = tokio::time::sleep(self.flush_interval) => {
                    self.flush().await;
                }
            }
        }
    }
}
