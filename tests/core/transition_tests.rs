//! Transition-planner tests: down confirmation, counters, sampling.

use crate::common::target;
use watchgrid::config::{CheckerConfig, Region};
use watchgrid::core::scheduler::transition::{plan_transition, AlertPlan, HealthPhase};
use watchgrid::core::{
    AlertDirection, DetailedStatus, ProbeResult, TargetMetadata, TargetStatus,
};

const NOW: i64 = 1_700_000_000_000;

fn offline_result(code: i32) -> ProbeResult {
    ProbeResult {
        status: TargetStatus::Offline,
        detailed: DetailedStatus::Down,
        status_code: code,
        response_time_ms: 120,
        timings: None,
        body_snippet: None,
        redirect_location: None,
        error: Some("HTTP status 502".into()),
        metadata: None,
        edge: None,
        ssl_cert: None,
        method_used: Some("GET".into()),
        range_used: true,
    }
}

fn online_result() -> ProbeResult {
    ProbeResult {
        status: TargetStatus::Online,
        detailed: DetailedStatus::Up,
        status_code: 200,
        response_time_ms: 80,
        timings: None,
        body_snippet: None,
        redirect_location: None,
        error: None,
        metadata: None,
        edge: None,
        ssl_cert: None,
        method_used: Some("GET".into()),
        range_used: true,
    }
}

#[test]
fn first_failure_is_held_online_and_rechecked() {
    // S1 shape: online target, first offline observation.
    let cfg = CheckerConfig::default();
    let t = target("t1", "https://example.com");

    let plan = plan_transition(&t, &offline_result(502), NOW, None, &cfg);
    assert_eq!(plan.reported_status, TargetStatus::Online);
    assert_eq!(plan.phase, HealthPhase::Probing { attempt: 1 });
    assert_eq!(plan.consecutive_failures, 1);
    assert_eq!(plan.consecutive_successes, 0);
    assert_eq!(plan.first_failure_at, Some(NOW));
    assert_eq!(plan.next_check_at, NOW + cfg.immediate_recheck_delay_ms);
    // The raw observation still goes to telemetry.
    assert!(plan.emit_telemetry);
    // Held status means no externally visible transition.
    assert!(plan.alert.is_none());
}

#[test]
fn confirmation_attempts_exhausted_reports_offline() {
    // S2 shape: two prior failures inside the window.
    let cfg = CheckerConfig::default();
    let mut t = target("t1", "https://example.com");
    t.consecutive_failures = 2;
    t.first_failure_at = Some(NOW - 60_000);
    t.last_checked_at = Some(NOW - 30_000);

    let plan = plan_transition(&t, &offline_result(502), NOW, None, &cfg);
    assert_eq!(plan.reported_status, TargetStatus::Offline);
    assert_eq!(plan.phase, HealthPhase::Confirmed(TargetStatus::Offline));
    assert_eq!(plan.consecutive_failures, 3);
    assert_eq!(
        plan.alert,
        Some(AlertPlan::Transition {
            previous: TargetStatus::Online,
            current: TargetStatus::Offline,
        })
    );
    // Standard interval once confirmed.
    assert_eq!(plan.next_check_at, NOW + 5 * 60_000);
}

#[test]
fn expired_window_skips_holding() {
    let cfg = CheckerConfig::default();
    let mut t = target("t1", "https://example.com");
    t.consecutive_failures = 1;
    t.first_failure_at = Some(NOW - cfg.down_confirmation_window_ms - 1);
    t.last_checked_at = Some(NOW - 60_000);

    let plan = plan_transition(&t, &offline_result(502), NOW, None, &cfg);
    assert_eq!(plan.reported_status, TargetStatus::Offline);
    assert_eq!(plan.consecutive_failures, 2);
}

#[test]
fn recovery_resets_counters_and_alerts_up() {
    let cfg = CheckerConfig::default();
    let mut t = target("t1", "https://example.com");
    t.status = TargetStatus::Offline;
    t.consecutive_failures = 5;
    t.first_failure_at = Some(NOW - 600_000);

    let plan = plan_transition(&t, &online_result(), NOW, None, &cfg);
    assert_eq!(plan.reported_status, TargetStatus::Online);
    assert_eq!(plan.phase, HealthPhase::Confirmed(TargetStatus::Online));
    assert_eq!(plan.consecutive_failures, 0);
    assert_eq!(plan.consecutive_successes, 1);
    assert_eq!(plan.first_failure_at, None);
    assert_eq!(
        plan.alert,
        Some(AlertPlan::Transition {
            previous: TargetStatus::Offline,
            current: TargetStatus::Online,
        })
    );
    // Counters stay mutually exclusive.
    assert!(plan.consecutive_failures == 0 || plan.consecutive_successes == 0);
}

#[test]
fn pending_mutation_status_prevents_duplicate_alert() {
    // The stored document still says online, but an unflushed Sink B
    // mutation already reported offline.
    let cfg = CheckerConfig::default();
    let mut t = target("t1", "https://example.com");
    t.consecutive_failures = 3;
    t.first_failure_at = Some(NOW - 600_000);

    let plan = plan_transition(
        &t,
        &offline_result(502),
        NOW,
        Some(TargetStatus::Offline),
        &cfg,
    );
    assert_eq!(plan.previous_status, TargetStatus::Offline);
    assert!(plan.alert.is_none());
}

#[test]
fn pending_down_flag_schedules_retry() {
    let cfg = CheckerConfig::default();
    let mut t = target("t1", "https://example.com");
    t.status = TargetStatus::Offline;
    t.consecutive_failures = 4;
    t.first_failure_at = Some(NOW - 600_000);
    t.pending_down_alert = true;

    let plan = plan_transition(&t, &offline_result(502), NOW, None, &cfg);
    assert_eq!(plan.reported_status, TargetStatus::Offline);
    assert_eq!(
        plan.alert,
        Some(AlertPlan::PendingRetry {
            direction: AlertDirection::Down,
        })
    );
    assert_eq!(plan.phase, HealthPhase::PendingAlert(AlertDirection::Down));
}

#[test]
fn heartbeat_samples_once_per_bucket() {
    let cfg = CheckerConfig::default();
    let mut t = target("t1", "https://example.com");

    // Same bucket as the last sample: steady online emits nothing.
    t.last_history_at = Some(NOW - 1);
    let plan = plan_transition(&t, &online_result(), NOW, None, &cfg);
    assert!(!plan.emit_telemetry);

    // Next bucket: heartbeat due.
    t.last_history_at = Some(NOW - cfg.history_sample_interval_ms - 1);
    let plan = plan_transition(&t, &online_result(), NOW, None, &cfg);
    assert!(plan.emit_telemetry);
}

#[test]
fn first_observation_always_emits_telemetry() {
    let cfg = CheckerConfig::default();
    let mut t = target("t1", "https://example.com");
    t.status = TargetStatus::Unknown;

    let plan = plan_transition(&t, &online_result(), NOW, None, &cfg);
    assert!(plan.emit_telemetry);
    // unknown -> online is not an alertable transition.
    assert!(plan.alert.is_none());
}

#[test]
fn fresh_metadata_reassigns_nearest_region() {
    let cfg = CheckerConfig::default();
    let mut t = target("t1", "https://example.com");
    t.region = Some(Region::UsCentral);

    let mut observed = online_result();
    observed.metadata = Some(TargetMetadata {
        lat: Some(50.11),
        lon: Some(8.68),
        ..Default::default()
    });

    let plan = plan_transition(&t, &observed, NOW, None, &cfg);
    assert_eq!(plan.region_assignment, Some(Region::EuCentral));

    // Already nearest: no reassignment churn.
    t.region = Some(Region::EuCentral);
    let plan = plan_transition(&t, &observed, NOW, None, &cfg);
    assert_eq!(plan.region_assignment, None);
}
