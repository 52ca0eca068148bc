//! Sink A tests: batching, partial failure, backoff and drop policy.

use crate::common::{telemetry_row, ManualClock};
use std::sync::Arc;
use watchgrid::adapters::MemoryWarehouse;
use watchgrid::config::TelemetryBufferConfig;
use watchgrid::core::{Clock, InsertOutcome, TelemetryBuffer, Warehouse, WarehouseError};

const T0: i64 = 1_700_000_000_000;

fn buffer_with(
    cfg: TelemetryBufferConfig,
) -> (Arc<TelemetryBuffer>, Arc<MemoryWarehouse>, Arc<ManualClock>) {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let clock = Arc::new(ManualClock::new(T0));
    let buffer = Arc::new(TelemetryBuffer::new(
        Arc::clone(&warehouse) as Arc<dyn Warehouse>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        cfg,
        "probe_telemetry",
    ));
    (buffer, warehouse, clock)
}

#[tokio::test]
async fn partial_failure_retries_only_failed_rows() {
    // S4: five rows, the warehouse rejects index 2.
    let (buffer, warehouse, _clock) = buffer_with(TelemetryBufferConfig::default());
    for i in 0..5 {
        buffer.enqueue(telemetry_row(&format!("r{i}"))).await;
    }
    warehouse
        .script_outcome(Ok(InsertOutcome::PartialFailure { indices: vec![2] }))
        .await;

    let report = buffer.flush().await;
    assert!(report.ran);
    assert_eq!(report.inserted, 4);
    assert_eq!(report.retried, 1);
    assert_eq!(buffer.len().await, 1);

    let ids: Vec<String> = warehouse
        .inserted_rows()
        .await
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec!["r0", "r1", "r3", "r4"]);

    let meta = buffer.failure_meta("r2").await.expect("failure meta");
    assert_eq!(meta.failures, 1);
    assert_eq!(meta.next_retry_at_ms, T0 + 5_000);
}

#[tokio::test]
async fn failed_row_waits_out_its_backoff() {
    let (buffer, warehouse, clock) = buffer_with(TelemetryBufferConfig::default());
    buffer.enqueue(telemetry_row("r1")).await;
    warehouse
        .script_outcome(Err(WarehouseError::Insert("boom".into())))
        .await;

    let report = buffer.flush().await;
    assert_eq!(report.retried, 1);

    // Before the retry gate opens the row is skipped.
    let report = buffer.flush().await;
    assert_eq!(report.skipped, 1);
    assert_eq!(report.inserted, 0);
    assert_eq!(buffer.len().await, 1);

    // Past the gate it goes through.
    clock.advance(5_001);
    let report = buffer.flush().await;
    assert_eq!(report.inserted, 1);
    assert!(buffer.is_empty().await);
}

#[tokio::test]
async fn row_is_dropped_after_failure_cap() {
    let cfg = TelemetryBufferConfig {
        max_failures_before_drop: 3,
        // Keep the time cap out of the way to isolate the count cap.
        failure_timeout_ms: i64::MAX,
        ..TelemetryBufferConfig::default()
    };
    let (buffer, warehouse, clock) = buffer_with(cfg);
    buffer.enqueue(telemetry_row("r1")).await;

    for _ in 0..3 {
        warehouse
            .script_outcome(Err(WarehouseError::Insert("boom".into())))
            .await;
    }

    let report = buffer.flush().await;
    assert_eq!(report.retried, 1);
    clock.advance(10_000);
    let report = buffer.flush().await;
    assert_eq!(report.retried, 1);
    clock.advance(20_000);
    // Third failure hits the cap: dropped, not retried.
    let report = buffer.flush().await;
    assert_eq!(report.dropped, 1);
    assert!(buffer.is_empty().await);
    assert!(warehouse.inserted_rows().await.is_empty());
}

#[tokio::test]
async fn row_is_dropped_after_time_in_buffer_cap() {
    let (buffer, warehouse, clock) = buffer_with(TelemetryBufferConfig::default());
    buffer.enqueue(telemetry_row("r1")).await;
    warehouse
        .script_outcome(Err(WarehouseError::Insert("boom".into())))
        .await;
    buffer.flush().await;

    clock.advance(600_001);
    let report = buffer.flush().await;
    assert_eq!(report.dropped, 1);
    assert!(buffer.is_empty().await);
}

#[tokio::test]
async fn re_enqueue_replaces_and_clears_failure_meta() {
    let (buffer, warehouse, _clock) = buffer_with(TelemetryBufferConfig::default());
    buffer.enqueue(telemetry_row("r1")).await;
    warehouse
        .script_outcome(Err(WarehouseError::Insert("boom".into())))
        .await;
    buffer.flush().await;
    assert!(buffer.failure_meta("r1").await.is_some());

    buffer.enqueue(telemetry_row("r1")).await;
    assert_eq!(buffer.len().await, 1);
    assert!(buffer.failure_meta("r1").await.is_none());
}

#[tokio::test]
async fn overflow_evicts_oldest_rows() {
    let cfg = TelemetryBufferConfig {
        max_buffer_size: 3,
        ..TelemetryBufferConfig::default()
    };
    let (buffer, _warehouse, _clock) = buffer_with(cfg);
    for i in 0..5 {
        buffer.enqueue(telemetry_row(&format!("r{i}"))).await;
    }
    assert_eq!(buffer.len().await, 3);
    // r0 and r1 were evicted; the newest three remain.
    assert!(buffer.failure_meta("r0").await.is_none());
    let report = buffer.flush().await;
    assert_eq!(report.inserted, 3);
}

#[tokio::test]
async fn batches_are_bounded_by_row_count() {
    let cfg = TelemetryBufferConfig {
        max_batch_rows: 2,
        ..TelemetryBufferConfig::default()
    };
    let (buffer, warehouse, _clock) = buffer_with(cfg);
    for i in 0..5 {
        buffer.enqueue(telemetry_row(&format!("r{i}"))).await;
    }
    let report = buffer.flush().await;
    assert_eq!(report.inserted, 5);
    assert_eq!(warehouse.batch_count().await, 3);
}

#[tokio::test]
async fn drain_ignores_retry_gates() {
    let (buffer, warehouse, _clock) = buffer_with(TelemetryBufferConfig::default());
    buffer.enqueue(telemetry_row("r1")).await;
    warehouse
        .script_outcome(Err(WarehouseError::Insert("boom".into())))
        .await;
    buffer.flush().await;

    // Without advancing the clock: drain pushes through anyway.
    let remaining = buffer.drain().await;
    assert_eq!(remaining, 0);
    assert_eq!(warehouse.inserted_rows().await.len(), 1);
}
