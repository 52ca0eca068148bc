//! Sink A: the telemetry insert buffer.
//!
//! Probe-result rows are collected in a keyed in-memory buffer and
//! batch-inserted into the warehouse. Failed rows are retried with
//! exponential backoff and dropped once they exhaust either the failure
//! count cap or their total time in the buffer. Admission is idempotent on
//! the row id: re-enqueueing replaces the buffered entry and clears its
//! failure bookkeeping.
//!
//! At most one flush runs at a time. Flush triggers:
//! - a periodic timer (`flush_interval_ms`),
//! - a debounce after each enqueue (`default_flush_delay_ms`),
//! - an accelerated flush on the high watermark,
//! - a backoff wake-up at the earliest pending retry,
//! - shutdown drain, which ignores retry gates and flushes until empty.

use crate::config::TelemetryBufferConfig;
use crate::core::ports::{Clock, InsertOutcome, Warehouse};
use crate::core::shutdown::ShutdownSignal;
use crate::core::types::TelemetryRow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

/// Per-row retry bookkeeping.
#[derive(Debug, Clone)]
pub struct FailureMeta {
    pub failures: u32,
    pub next_retry_at_ms: i64,
    pub first_failure_at_ms: i64,
    pub last_error: String,
}

struct BufferedRow {
    row: TelemetryRow,
    /// Serialized size estimate, used for the byte-bounded batching.
    bytes: usize,
    enqueued_at_ms: i64,
    /// Admission order; oldest rows are evicted first on overflow.
    order: u64,
    failure: Option<FailureMeta>,
}

#[derive(Default)]
struct BufferState {
    rows: HashMap<String, BufferedRow>,
    next_order: u64,
}

/// Summary of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// False when another flush was already running and this call no-op'd.
    pub ran: bool,
    pub inserted: usize,
    pub retried: usize,
    pub dropped: usize,
    /// Rows still inside their retry backoff window.
    pub skipped: usize,
}

/// The telemetry buffer. Shared by every probe task in a tick; all public
/// methods take `&self`.
pub struct TelemetryBuffer {
    warehouse: Arc<dyn Warehouse>,
    clock: Arc<dyn Clock>,
    cfg: TelemetryBufferConfig,
    table: String,
    state: Mutex<BufferState>,
    /// Serializes flushes; `try_lock` makes re-entrant attempts no-ops.
    flush_gate: Mutex<()>,
    /// Earliest requested flush deadline for the background task.
    next_flush_at: std::sync::Mutex<Option<Instant>>,
    wake: Notify,
    draining: AtomicBool,
}

impl TelemetryBuffer {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        clock: Arc<dyn Clock>,
        cfg: TelemetryBufferConfig,
        table: impl Into<String>,
    ) -> Self {
        Self {
            warehouse,
            clock,
            cfg,
            table: table.into(),
            state: Mutex::new(BufferState::default()),
            flush_gate: Mutex::new(()),
            next_flush_at: std::sync::Mutex::new(None),
            wake: Notify::new(),
            draining: AtomicBool::new(false),
        }
    }

    /// Admit one row. Keyed on the row id: a duplicate id replaces the
    /// buffered entry and clears its failure metadata.
    pub async fn enqueue(&self, row: TelemetryRow) {
        let bytes = serde_json::to_vec(&row).map(|v| v.len()).unwrap_or(512);
        let now_ms = self.clock.epoch_ms();

        let (len, overflowed) = {
            let mut state = self.state.lock().await;
            let order = state.next_order;
            state.next_order += 1;
            state.rows.insert(
                row.id.clone(),
                BufferedRow {
                    row,
                    bytes,
                    enqueued_at_ms: now_ms,
                    order,
                    failure: None,
                },
            );

            let mut evicted = 0usize;
            while state.rows.len() > self.cfg.max_buffer_size {
                let oldest = state
                    .rows
                    .iter()
                    .min_by_key(|(_, r)| r.order)
                    .map(|(id, _)| id.clone());
                match oldest {
                    Some(id) => {
                        state.rows.remove(&id);
                        evicted += 1;
                    }
                    None => break,
                }
            }
            (state.rows.len(), evicted)
        };

        if overflowed > 0 {
            warn!(evicted = overflowed, "telemetry buffer over capacity, dropped oldest rows");
        }

        let delay = if len >= self.cfg.high_watermark {
            self.cfg.watermark_flush_delay_ms
        } else {
            self.cfg.default_flush_delay_ms
        };
        self.request_flush_in(Duration::from_millis(delay));
    }

    /// Buffered row count.
    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Failure metadata for a row, if it is buffered and has failed.
    pub async fn failure_meta(&self, row_id: &str) -> Option<FailureMeta> {
        self.state
            .lock()
            .await
            .rows
            .get(row_id)
            .and_then(|r| r.failure.clone())
    }

    /// Run one flush pass. No-ops (with `ran: false`) when a flush is
    /// already in progress.
    pub async fn flush(&self) -> FlushReport {
        let Ok(_guard) = self.flush_gate.try_lock() else {
            return FlushReport::default();
        };

        let mut report = FlushReport {
            ran: true,
            ..Default::default()
        };
        let now_ms = self.clock.epoch_ms();
        let draining = self.draining.load(Ordering::SeqCst);

        // Snapshot under the state lock, insert outside it.
        let mut ready: Vec<(String, TelemetryRow, usize)> = Vec::new();
        {
            let mut state = self.state.lock().await;
            let mut drop_ids = Vec::new();
            for (id, entry) in state.rows.iter() {
                if let Some(meta) = &entry.failure {
                    if meta.failures >= self.cfg.max_failures_before_drop
                        || now_ms - entry.enqueued_at_ms >= self.cfg.failure_timeout_ms
                    {
                        drop_ids.push(id.clone());
                        continue;
                    }
                    if !draining && meta.next_retry_at_ms > now_ms {
                        report.skipped += 1;
                        continue;
                    }
                } else if now_ms - entry.enqueued_at_ms >= self.cfg.failure_timeout_ms {
                    drop_ids.push(id.clone());
                    continue;
                }
                ready.push((id.clone(), entry.row.clone(), entry.bytes));
            }
            for id in &drop_ids {
                if let Some(entry) = state.rows.remove(id) {
                    warn!(
                        row_id = %id,
                        failures = entry.failure.map(|f| f.failures).unwrap_or(0),
                        "dropping telemetry row, retry budget exhausted"
                    );
                    report.dropped += 1;
                }
            }
            // Stable submit order within the snapshot.
            let order: HashMap<&str, u64> = state
                .rows
                .iter()
                .map(|(id, r)| (id.as_str(), r.order))
                .collect();
            ready.sort_by_key(|(id, _, _)| order.get(id.as_str()).copied().unwrap_or(u64::MAX));
        }

        for batch in chunk_batches(&ready, self.cfg.max_batch_rows, self.cfg.max_batch_bytes) {
            let rows: Vec<TelemetryRow> = batch.iter().map(|(_, row, _)| row.clone()).collect();
            match self.warehouse.insert(&self.table, &rows).await {
                Ok(InsertOutcome::Ok) => {
                    self.remove_rows(batch.iter().map(|(id, _, _)| id.as_str())).await;
                    report.inserted += rows.len();
                }
                Ok(InsertOutcome::PartialFailure { indices }) => {
                    let mut failed = vec![false; batch.len()];
                    for idx in indices {
                        if let Some(slot) = failed.get_mut(idx) {
                            *slot = true;
                        }
                    }
                    let succeeded = batch
                        .iter()
                        .zip(&failed)
                        .filter(|(_, f)| !**f)
                        .map(|((id, _, _), _)| id.as_str());
                    self.remove_rows(succeeded).await;
                    report.inserted += failed.iter().filter(|f| !**f).count();

                    for ((id, _, _), _) in batch.iter().zip(&failed).filter(|(_, f)| **f) {
                        let dropped = self
                            .record_failure(id, now_ms, "warehouse rejected row".to_string())
                            .await;
                        if dropped {
                            report.dropped += 1;
                        } else {
                            report.retried += 1;
                        }
                    }
                }
                Err(e) => {
                    debug!(error = %e, rows = rows.len(), "telemetry batch insert failed");
                    for (id, _, _) in &batch {
                        let dropped = self.record_failure(id, now_ms, e.to_string()).await;
                        if dropped {
                            report.dropped += 1;
                        } else {
                            report.retried += 1;
                        }
                    }
                }
            }
        }

        // Schedule the backoff wake-up for whatever is still pending.
        if let Some(earliest) = self.earliest_retry_ms().await {
            let delay_ms = (earliest - self.clock.epoch_ms()).max(0) as u64;
            self.request_flush_in(Duration::from_millis(delay_ms));
        }

        report
    }

    /// Shutdown drain: force every entry past its retry gate and flush
    /// until the buffer is empty or the retry budget gives out.
    pub async fn drain(&self) -> usize {
        self.draining.store(true, Ordering::SeqCst);
        let mut passes = 0u32;
        while !self.is_empty().await {
            let report = self.flush().await;
            passes += 1;
            if passes > self.cfg.max_failures_before_drop + 2 {
                break;
            }
            if report.ran && report.inserted == 0 && report.retried == 0 && report.dropped == 0 {
                break;
            }
        }
        let remaining = self.len().await;
        if remaining > 0 {
            warn!(remaining, "telemetry drain left rows behind");
        }
        remaining
    }

    /// Background flush task: waits for the earliest requested deadline
    /// (or the periodic interval) and flushes.
    pub async fn run(self: Arc<Self>, shutdown: Arc<ShutdownSignal>) {
        loop {
            if shutdown.is_triggered() {
                break;
            }
            let deadline = self
                .peek_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_millis(self.cfg.flush_interval_ms));

            tokio::select! {
                _ = self.wake.notified() => continue,
                _ = shutdown.triggered() => break,
                _ = tokio::time::sleep_until(deadline.into()) => {
                    self.clear_deadline(deadline);
                    let _ = self.flush().await;
                }
            }
        }
    }

    fn request_flush_in(&self, delay: Duration) {
        let at = Instant::now() + delay;
        let mut slot = self
            .next_flush_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *slot {
            Some(existing) if existing <= at => {}
            _ => *slot = Some(at),
        }
        drop(slot);
        self.wake.notify_one();
    }

    fn peek_deadline(&self) -> Option<Instant> {
        *self
            .next_flush_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn clear_deadline(&self, fired: Instant) {
        let mut slot = self
            .next_flush_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if matches!(*slot, Some(at) if at <= fired) {
            *slot = None;
        }
    }

    async fn remove_rows(&self, ids: impl Iterator<Item = &str>) {
        let mut state = self.state.lock().await;
        for id in ids {
            state.rows.remove(id);
        }
    }

    /// Record one failure. Returns true when the row was dropped because
    /// it reached the failure cap.
    async fn record_failure(&self, id: &str, now_ms: i64, error: String) -> bool {
        let mut state = self.state.lock().await;
        let Some(entry) = state.rows.get_mut(id) else {
            return false;
        };

        let failures = entry.failure.as_ref().map(|f| f.failures).unwrap_or(0) + 1;
        if failures >= self.cfg.max_failures_before_drop {
            state.rows.remove(id);
            warn!(row_id = %id, failures, "dropping telemetry row after final failed attempt");
            return true;
        }

        let first_failure_at_ms = entry
            .failure
            .as_ref()
            .map(|f| f.first_failure_at_ms)
            .unwrap_or(now_ms);
        entry.failure = Some(FailureMeta {
            failures,
            next_retry_at_ms: now_ms + backoff_ms(failures, &self.cfg),
            first_failure_at_ms,
            last_error: error,
        });
        false
    }

    async fn earliest_retry_ms(&self) -> Option<i64> {
        self.state
            .lock()
            .await
            .rows
            .values()
            .filter_map(|r| r.failure.as_ref().map(|f| f.next_retry_at_ms))
            .min()
    }
}

/// `min(initial * 2^(n-1), max)` for the n-th failure.
fn backoff_ms(failures: u32, cfg: &TelemetryBufferConfig) -> i64 {
    let exponent = failures.saturating_sub(1).min(20);
    cfg.backoff_initial_ms
        .saturating_mul(1i64 << exponent)
        .min(cfg.backoff_max_ms)
}

/// Greedy batching bounded by both row count and estimated bytes. A single
/// oversized row still ships alone.
fn chunk_batches<'a>(
    ready: &'a [(String, TelemetryRow, usize)],
    max_rows: usize,
    max_bytes: usize,
) -> Vec<Vec<&'a (String, TelemetryRow, usize)>> {
    let mut batches = Vec::new();
    let mut current: Vec<&(String, TelemetryRow, usize)> = Vec::new();
    let mut current_bytes = 0usize;

    for entry in ready {
        let (_, _, bytes) = entry;
        let over_rows = current.len() >= max_rows;
        let over_bytes = !current.is_empty() && current_bytes + bytes > max_bytes;
        if over_rows || over_bytes {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += bytes;
        current.push(entry);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
