//! End-to-end tick scenarios against the in-memory store.

use crate::common::{http_response, rig, rig_with, target};
use watchgrid::config::{CheckerConfig, Region};
use watchgrid::core::scheduler::lock::RegionLock;
use watchgrid::core::{
    AlertOutcome, AlertSkipReason, GeoInfo, TargetStatus, TargetStore, TickLockStatus,
};

const T0: i64 = 1_700_000_000_000;

#[tokio::test]
async fn first_failure_holds_online_and_schedules_recheck() {
    // S1: probe fails once; externally the target stays online.
    let rig = rig(T0);
    let mut t = target("t1", "https://example.com/");
    t.metadata_checked_at = Some(T0); // keep the resolver out of this one
    rig.store.insert_target(t).await;
    rig.transport.push(Ok(http_response(502, &[], b""))).await;

    let outcome = rig.scheduler.run_tick(Region::canonical()).await.unwrap();
    assert_eq!(outcome.probed, 1);
    assert_eq!(outcome.lock, TickLockStatus::Held);

    let stored = rig.store.get_target("t1").await.unwrap();
    assert_eq!(stored.status, TargetStatus::Online);
    assert_eq!(stored.consecutive_failures, 1);
    assert_eq!(stored.consecutive_successes, 0);
    assert_eq!(stored.first_failure_at, Some(T0));
    assert_eq!(stored.next_check_at, T0 + rig.cfg.immediate_recheck_delay_ms);
    assert_eq!(stored.last_checked_at, Some(T0));

    // Telemetry carries the raw offline observation.
    rig.telemetry.flush().await;
    let rows = rig.warehouse.inserted_rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, TargetStatus::Offline);
    assert_eq!(rows[0].status_code, 502);

    // No alert fired.
    assert!(rig.alerts.calls().await.is_empty());
}

#[tokio::test]
async fn confirmed_offline_fires_alert_and_clears_pending() {
    // S2: third failure inside the window confirms the down state.
    let rig = rig(T0);
    let mut t = target("t1", "https://example.com/");
    t.consecutive_failures = 2;
    t.first_failure_at = Some(T0 - 60_000);
    t.last_checked_at = Some(T0 - 30_000);
    t.metadata_checked_at = Some(T0);
    rig.store.insert_target(t).await;
    rig.transport.push(Ok(http_response(502, &[], b""))).await;

    rig.scheduler.run_tick(Region::canonical()).await.unwrap();

    let stored = rig.store.get_target("t1").await.unwrap();
    assert_eq!(stored.status, TargetStatus::Offline);
    assert_eq!(stored.consecutive_failures, 3);
    assert_eq!(stored.consecutive_successes, 0);
    assert!(!stored.pending_down_alert);
    assert!(!stored.pending_up_alert);
    // Standard interval, not an immediate recheck.
    assert_eq!(stored.next_check_at, T0 + 5 * 60_000);

    let calls = rig.alerts.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].previous, TargetStatus::Online);
    assert_eq!(calls[0].current, TargetStatus::Offline);
}

#[tokio::test]
async fn lock_contention_skips_the_tick() {
    // S5: another owner holds an unexpired lock.
    let rig = rig(T0);
    rig.store.insert_target(target("t1", "https://example.com/")).await;
    rig.store.set_now_ms(T0);
    let doc = RegionLock::doc_for(Region::canonical());
    rig.store
        .acquire_lock(&doc, "someone-else", 25 * 60_000)
        .await
        .unwrap();

    let outcome = rig.scheduler.run_tick(Region::canonical()).await.unwrap();
    assert_eq!(outcome.lock, TickLockStatus::Busy);
    assert_eq!(outcome.probed, 0);
    assert!(rig.transport.requests().await.is_empty());
}

#[tokio::test]
async fn throttled_alert_sets_pending_flag_and_retries_next_tick() {
    // S6: delivery throttled -> pending_down_alert; retried once the same
    // status is confirmed again.
    let rig = rig(T0);
    let mut t = target("t1", "https://example.com/");
    t.consecutive_failures = 2;
    t.first_failure_at = Some(T0 - 60_000);
    t.last_checked_at = Some(T0 - 30_000);
    t.metadata_checked_at = Some(T0);
    rig.store.insert_target(t).await;

    rig.transport.push(Ok(http_response(502, &[], b""))).await;
    rig.alerts
        .push_outcome(AlertOutcome::skipped(AlertSkipReason::Throttle))
        .await;

    rig.scheduler.run_tick(Region::canonical()).await.unwrap();

    let stored = rig.store.get_target("t1").await.unwrap();
    assert_eq!(stored.status, TargetStatus::Offline);
    assert!(stored.pending_down_alert);
    assert_eq!(stored.pending_since, Some(T0));

    // Next tick: still offline, no transition, but the pending flag
    // drives a retry which now succeeds.
    rig.clock.advance(5 * 60_000 + 1);
    rig.transport.push(Ok(http_response(502, &[], b""))).await;

    rig.scheduler.run_tick(Region::canonical()).await.unwrap();

    let stored = rig.store.get_target("t1").await.unwrap();
    assert!(!stored.pending_down_alert);
    assert_eq!(stored.pending_since, None);

    let calls = rig.alerts.calls().await;
    assert_eq!(calls.len(), 2);
    assert!(!calls[0].pending_retry);
    assert!(calls[1].pending_retry);
}

#[tokio::test]
async fn recovery_fires_up_alert() {
    let rig = rig(T0);
    let mut t = target("t1", "https://example.com/");
    t.status = TargetStatus::Offline;
    t.consecutive_failures = 5;
    t.first_failure_at = Some(T0 - 3_600_000);
    t.metadata_checked_at = Some(T0);
    rig.store.insert_target(t).await;
    rig.transport.push(Ok(http_response(200, &[], b"ok"))).await;

    rig.scheduler.run_tick(Region::canonical()).await.unwrap();

    let stored = rig.store.get_target("t1").await.unwrap();
    assert_eq!(stored.status, TargetStatus::Online);
    assert_eq!(stored.consecutive_failures, 0);
    assert_eq!(stored.consecutive_successes, 1);
    assert_eq!(stored.first_failure_at, None);
    assert!(stored.last_response_time_ms.is_some());

    let calls = rig.alerts.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].previous, TargetStatus::Offline);
    assert_eq!(calls[0].current, TargetStatus::Online);
}

#[tokio::test]
async fn failing_budget_auto_disables_instead_of_probing() {
    let mut cfg = CheckerConfig::default();
    cfg.disable_after_consecutive_failures = 10;
    let rig = rig_with(T0, cfg, GeoInfo::default());

    let mut t = target("t1", "https://example.com/");
    t.status = TargetStatus::Offline;
    t.consecutive_failures = 12;
    t.first_failure_at = Some(T0 - 3_600_000);
    rig.store.insert_target(t).await;

    let outcome = rig.scheduler.run_tick(Region::canonical()).await.unwrap();
    assert_eq!(outcome.disabled, 1);
    assert_eq!(outcome.probed, 0);
    assert!(rig.transport.requests().await.is_empty());

    let stored = rig.store.get_target("t1").await.unwrap();
    assert!(stored.disabled);
    assert_eq!(stored.status, TargetStatus::Disabled);
    assert!(stored.disabled_reason.is_some());
    assert_eq!(stored.disabled_at, Some(T0));

    // The delivery side heard about the disable.
    let calls = rig.alerts.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].current, TargetStatus::Disabled);
}

#[tokio::test]
async fn unassigned_target_gets_nearest_region_from_metadata() {
    // Frankfurt coordinates via the geo port; the canonical region probes
    // unassigned targets and writes the region back.
    let geo = GeoInfo {
        lat: Some(50.11),
        lon: Some(8.68),
        country: Some("DE".into()),
        ..Default::default()
    };
    let rig = rig_with(T0, CheckerConfig::default(), geo);

    let mut t = target("t1", "https://127.0.0.1/");
    t.region = None; // unassigned
    rig.store.insert_target(t).await;
    rig.transport.push(Ok(http_response(200, &[], b"ok"))).await;

    rig.scheduler.run_tick(Region::canonical()).await.unwrap();

    let stored = rig.store.get_target("t1").await.unwrap();
    assert_eq!(stored.region, Some(Region::EuCentral));
    assert!(stored.metadata_checked_at.is_some());
    let metadata = stored.metadata.expect("metadata stored");
    assert_eq!(metadata.country.as_deref(), Some("DE"));
    assert_eq!(metadata.primary_ip.as_deref(), Some("127.0.0.1"));
}

#[tokio::test]
async fn shutdown_defers_all_work() {
    let rig = rig(T0);
    rig.store.insert_target(target("t1", "https://example.com/")).await;
    rig.shutdown.trigger();

    let outcome = rig.scheduler.run_tick(Region::canonical()).await.unwrap();
    assert_eq!(outcome.probed, 0);
    assert!(rig.transport.requests().await.is_empty());
}

#[tokio::test]
async fn steady_online_advances_freshness_without_alerts() {
    let rig = rig(T0);
    let mut t = target("t1", "https://example.com/");
    t.consecutive_successes = 7;
    t.last_response_time_ms = Some(27);
    t.last_history_at = Some(T0 - 1); // same history bucket
    t.last_checked_at = Some(T0 - 5 * 60_000);
    t.metadata_checked_at = Some(T0);
    rig.store.insert_target(t).await;
    rig.transport.push(Ok(http_response(200, &[], b"ok"))).await;

    rig.scheduler.run_tick(Region::canonical()).await.unwrap();

    let stored = rig.store.get_target("t1").await.unwrap();
    assert_eq!(stored.status, TargetStatus::Online);
    assert_eq!(stored.consecutive_successes, 8);
    assert_eq!(stored.next_check_at, T0 + 5 * 60_000);
    assert_eq!(stored.last_checked_at, Some(T0));

    // Steady state inside the sample bucket: no telemetry, no alerts.
    rig.telemetry.flush().await;
    assert!(rig.warehouse.inserted_rows().await.is_empty());
    assert!(rig.alerts.calls().await.is_empty());
}

#[tokio::test]
async fn due_targets_page_across_regions_independently() {
    let rig = rig(T0);
    let mut eu = target("eu-1", "https://eu.example.com/");
    eu.region = Some(Region::EuWest);
    eu.metadata_checked_at = Some(T0);
    let mut us = target("us-1", "https://us.example.com/");
    us.region = Some(Region::UsCentral);
    us.metadata_checked_at = Some(T0);
    rig.store.insert_target(eu).await;
    rig.store.insert_target(us).await;

    rig.transport.push(Ok(http_response(200, &[], b""))).await;
    let outcome = rig.scheduler.run_tick(Region::EuWest).await.unwrap();
    assert_eq!(outcome.probed, 1);

    let eu = rig.store.get_target("eu-1").await.unwrap();
    let us = rig.store.get_target("us-1").await.unwrap();
    assert_eq!(eu.last_checked_at, Some(T0));
    assert_eq!(us.last_checked_at, None);
}
