//! Per-probe transition planning.
//!
//! Pure logic: given the stored target, one raw probe observation and the
//! wall clock, produce the replacement counter pair, the externally
//! reported status (which may be *held* at online while a down state is
//! being confirmed), the next check time, the telemetry sampling decision
//! and the alert action. The field-level mutation for Sink B is derived
//! from the plan.
//!
//! The interlocking states are modeled as a small sum type
//! ([`HealthPhase`]) instead of loose booleans; the store representation
//! is only assembled at mutation-build time.

use crate::config::{CheckerConfig, Region};
use crate::core::alert::AlertDirection;
use crate::core::types::{
    fields, MutationUpdate, ProbeResult, Target, TargetStatus,
};

/// Health state of a target after one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthPhase {
    /// Online with no pending confirmation.
    Healthy,
    /// Offline observed, still inside the confirmation window; the
    /// external status is held at online while rechecks run.
    Probing { attempt: u32 },
    /// The observed status is final.
    Confirmed(TargetStatus),
    /// Status is stable but an alert delivery is still owed.
    PendingAlert(AlertDirection),
}

/// Alert action decided by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertPlan {
    /// A genuine status flip to deliver.
    Transition {
        previous: TargetStatus,
        current: TargetStatus,
    },
    /// Same status confirmed again while a pending flag is set.
    PendingRetry { direction: AlertDirection },
}

/// Result of planning one observation.
#[derive(Debug, Clone)]
pub struct TransitionPlan {
    /// Effective previous status (pending Sink B mutation wins over the
    /// stored document).
    pub previous_status: TargetStatus,
    /// Externally reported status after this observation.
    pub reported_status: TargetStatus,
    pub phase: HealthPhase,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub first_failure_at: Option<i64>,
    pub next_check_at: i64,
    /// Emit a telemetry row for this observation.
    pub emit_telemetry: bool,
    pub alert: Option<AlertPlan>,
    /// Nearest-region reassignment derived from fresh metadata.
    pub region_assignment: Option<Region>,
}

/// Plan the transition for one probe observation.
///
/// `pending_status` is the status carried by the most recent unflushed
/// Sink B mutation for this target, when one exists.
pub fn plan_transition(
    target: &Target,
    observed: &ProbeResult,
    now_ms: i64,
    pending_status: Option<TargetStatus>,
    cfg: &CheckerConfig,
) -> TransitionPlan {
    let previous_status = pending_status.unwrap_or(target.status);
    let interval_ms = target.interval_ms(cfg.check_interval_minutes);

    let (
        reported_status,
        phase,
        consecutive_failures,
        consecutive_successes,
        first_failure_at,
        next_check_at,
    ) = if observed.is_offline() {
        let failures = target.consecutive_failures + 1;
        let first_failure = if target.consecutive_failures == 0 {
            now_ms
        } else {
            target.first_failure_at.unwrap_or(now_ms)
        };

        let within_window = now_ms - first_failure < cfg.down_confirmation_window_ms;
        let held = within_window && failures < cfg.down_confirmation_attempts;

        if held {
            // Not offline yet as far as the outside world is concerned;
            // recheck quickly to confirm.
            let held_status = if previous_status == TargetStatus::Offline {
                TargetStatus::Offline
            } else {
                TargetStatus::Online
            };
            (
                held_status,
                HealthPhase::Probing { attempt: failures },
                failures,
                0,
                Some(first_failure),
                now_ms + cfg.immediate_recheck_delay_ms,
            )
        } else {
            let next_check = if failures == 1 && immediate_recheck_applies(target, now_ms, cfg) {
                now_ms + cfg.immediate_recheck_delay_ms
            } else {
                now_ms + interval_ms
            };
            (
                TargetStatus::Offline,
                HealthPhase::Confirmed(TargetStatus::Offline),
                failures,
                0,
                Some(first_failure),
                next_check,
            )
        }
    } else {
        let successes = target.consecutive_successes + 1;
        let phase = if previous_status == TargetStatus::Offline {
            HealthPhase::Confirmed(TargetStatus::Online)
        } else {
            HealthPhase::Healthy
        };
        (
            TargetStatus::Online,
            phase,
            0,
            successes,
            None,
            now_ms + interval_ms,
        )
    };

    let emit_telemetry = previous_status != observed.status
        || (observed.status == TargetStatus::Online && heartbeat_due(target, now_ms, cfg));

    let alert = if reported_status != previous_status {
        Some(AlertPlan::Transition {
            previous: previous_status,
            current: reported_status,
        })
    } else if reported_status == TargetStatus::Offline && target.pending_down_alert {
        Some(AlertPlan::PendingRetry {
            direction: AlertDirection::Down,
        })
    } else if reported_status == TargetStatus::Online && target.pending_up_alert {
        Some(AlertPlan::PendingRetry {
            direction: AlertDirection::Up,
        })
    } else {
        None
    };

    let phase = match (&alert, phase) {
        (Some(AlertPlan::PendingRetry { direction }), _) => HealthPhase::PendingAlert(*direction),
        (_, p) => p,
    };

    let region_assignment = observed.metadata.as_ref().and_then(|meta| {
        let (lat, lon) = (meta.lat?, meta.lon?);
        let nearest = Region::nearest(lat, lon);
        (target.region != Some(nearest)).then_some(nearest)
    });

    TransitionPlan {
        previous_status,
        reported_status,
        phase,
        consecutive_failures,
        consecutive_successes,
        first_failure_at,
        next_check_at,
        emit_telemetry,
        alert,
        region_assignment,
    }
}

/// A new first failure rechecks immediately only when the previous check
/// is old enough; back-to-back rechecks would add no signal.
fn immediate_recheck_applies(target: &Target, now_ms: i64, cfg: &CheckerConfig) -> bool {
    if !cfg.immediate_recheck_enabled {
        return false;
    }
    target
        .last_checked_at
        .map_or(true, |last| now_ms - last >= cfg.immediate_recheck_window_ms)
}

/// Online heartbeat sampling: emit when the current history bucket is past
/// the last sampled one.
fn heartbeat_due(target: &Target, now_ms: i64, cfg: &CheckerConfig) -> bool {
    match target.last_history_at {
        None => true,
        Some(last) => cfg.history_bucket(now_ms) > cfg.history_bucket(last),
    }
}

/// Assemble the Sink B mutation for a planned transition.
///
/// Freshness fields are always written; everything else only when it
/// diverges from the stored document, so a steady-state tick stays a
/// minimal update. Pending-alert flags are merged in afterwards by the
/// scheduler, once the gate outcome is known.
pub fn build_mutation(
    target: &Target,
    observed: &ProbeResult,
    plan: &TransitionPlan,
    now_ms: i64,
    metadata_refreshed: bool,
    ssl_refreshed: bool,
) -> MutationUpdate {
    let mut update = MutationUpdate::new(&target.id);
    update.set(fields::LAST_CHECKED_AT, now_ms);
    update.set(fields::NEXT_CHECK_AT, plan.next_check_at);

    if plan.reported_status != target.status {
        update.set(fields::STATUS, plan.reported_status);
    }
    if Some(observed.detailed) != target.detailed_status {
        update.set(fields::DETAILED_STATUS, observed.detailed);
    }
    if observed.status_code != target.last_status_code {
        update.set(fields::LAST_STATUS_CODE, observed.status_code);
    }
    if observed.status == TargetStatus::Online
        && Some(observed.response_time_ms) != target.last_response_time_ms
    {
        update.set(fields::LAST_RESPONSE_TIME_MS, observed.response_time_ms);
    }
    if observed.error != target.last_error {
        update.set(fields::LAST_ERROR, &observed.error);
    }

    if plan.consecutive_failures != target.consecutive_failures {
        update.set(fields::CONSECUTIVE_FAILURES, plan.consecutive_failures);
    }
    if plan.consecutive_successes != target.consecutive_successes {
        update.set(fields::CONSECUTIVE_SUCCESSES, plan.consecutive_successes);
    }
    if plan.first_failure_at != target.first_failure_at {
        update.set(fields::FIRST_FAILURE_AT, plan.first_failure_at);
    }

    if plan.emit_telemetry {
        update.set(fields::LAST_HISTORY_AT, now_ms);
    }

    if let Some(region) = plan.region_assignment {
        update.set(fields::REGION, region);
    }

    if metadata_refreshed {
        update.set(fields::METADATA_CHECKED_AT, now_ms);
        if let Some(meta) = &observed.metadata {
            update.set(fields::METADATA, meta);
        }
    }

    if ssl_refreshed {
        update.set(fields::SSL_CHECKED_AT, now_ms);
        if let Some(cert) = &observed.ssl_cert {
            update.set(fields::SSL_CERT, cert);
        }
    }

    update
}
