//! Alert trigger gate.
//!
//! Policy layer in front of the delivery port: decides *whether* an alert
//! for a status transition may fire, leaving the *how* (email/SMS/webhook
//! fan-out) to the injected [`AlertPort`]. Holds the per-tick throttle set
//! and the hourly/monthly per-user budgets.
//!
//! Delivery is at-least-once: when the gate (or the port) declines with a
//! retryable reason, the scheduler persists a pending flag on the target
//! and retries the flagged side on a later confirming probe.

use crate::core::ports::{
    AlertContext, AlertOutcome, AlertPort, AlertSettings, AlertSkipReason, TransitionCounters,
};
use crate::core::types::{SslCertSnapshot, Target, TargetStatus};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Direction of an alerted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertDirection {
    Down,
    Up,
}

impl AlertDirection {
    /// The transition a pending retry re-delivers.
    pub fn as_transition(self) -> (TargetStatus, TargetStatus) {
        match self {
            AlertDirection::Down => (TargetStatus::Online, TargetStatus::Offline),
            AlertDirection::Up => (TargetStatus::Offline, TargetStatus::Online),
        }
    }
}

#[derive(Default)]
struct TickCaches {
    /// Targets already alerted this tick, per direction.
    throttled: HashSet<(String, AlertDirection)>,
    /// Per-user delivery counts keyed by hour bucket.
    hourly: HashMap<String, (i64, u32)>,
    /// Per-user delivery counts keyed by (year, month).
    monthly: HashMap<String, ((i32, u32), u32)>,
}

/// The alert gate. Shared across probe tasks; all methods take `&self`.
pub struct AlertGate {
    port: Arc<dyn AlertPort>,
    caches: Mutex<TickCaches>,
}

impl AlertGate {
    pub fn new(port: Arc<dyn AlertPort>) -> Self {
        Self {
            port,
            caches: Mutex::new(TickCaches::default()),
        }
    }

    /// Reset the per-tick throttle set. Budgets survive; their buckets
    /// expire on their own.
    pub async fn begin_tick(&self) {
        self.caches.lock().await.throttled.clear();
    }

    /// Gate and deliver an alert for a status transition.
    ///
    /// Fires only for `unknown→offline`, `online→offline` and
    /// `offline→online`; anything else resolves to `delivered: false`
    /// without a reason (nothing to deliver, nothing to retry).
    pub async fn notify_transition(
        &self,
        target: &Target,
        previous: TargetStatus,
        current: TargetStatus,
        counters: TransitionCounters,
        settings: &AlertSettings,
        context: &AlertContext,
        now_ms: i64,
    ) -> AlertOutcome {
        let Some(direction) = transition_direction(previous, current) else {
            return AlertOutcome {
                delivered: false,
                reason: None,
            };
        };

        let consecutive = match direction {
            AlertDirection::Down => counters.consecutive_failures,
            AlertDirection::Up => counters.consecutive_successes,
        };
        if consecutive < settings.min_consecutive_events {
            debug!(
                target_id = %target.id,
                consecutive,
                threshold = settings.min_consecutive_events,
                "transition below consecutive-event threshold"
            );
            return AlertOutcome::skipped(AlertSkipReason::Flap);
        }

        if settings.email.is_none() && settings.sms.is_none() && settings.webhook_url.is_none() {
            return AlertOutcome::skipped(AlertSkipReason::MissingRecipient);
        }

        if let Some(reason) = self
            .check_budgets(&target.id, &target.user_id, direction, settings, now_ms)
            .await
        {
            return AlertOutcome::skipped(reason);
        }

        let outcome = self
            .port
            .trigger_alert(target, previous, current, counters, settings, context)
            .await;

        if outcome.delivered {
            self.record_delivery(&target.id, &target.user_id, direction, now_ms)
                .await;
        }
        outcome
    }

    /// Re-deliver a pending-flagged alert after a confirming probe.
    pub async fn retry_pending(
        &self,
        target: &Target,
        direction: AlertDirection,
        counters: TransitionCounters,
        settings: &AlertSettings,
        context: &AlertContext,
        now_ms: i64,
    ) -> AlertOutcome {
        let (previous, current) = direction.as_transition();
        self.notify_transition(target, previous, current, counters, settings, context, now_ms)
            .await
    }

    /// Notify the delivery side that a target was auto-disabled.
    pub async fn notify_disabled(
        &self,
        target: &Target,
        previous: TargetStatus,
        settings: &AlertSettings,
        context: &AlertContext,
    ) -> AlertOutcome {
        self.port
            .trigger_alert(
                target,
                previous,
                TargetStatus::Disabled,
                TransitionCounters {
                    consecutive_failures: target.consecutive_failures,
                    consecutive_successes: target.consecutive_successes,
                },
                settings,
                context,
            )
            .await
    }

    /// Forward an SSL certificate alert (expiring or changed cert).
    pub async fn notify_ssl(
        &self,
        target: &Target,
        cert: &SslCertSnapshot,
        context: &AlertContext,
    ) -> AlertOutcome {
        self.port.trigger_ssl_alert(target, cert, context).await
    }

    async fn check_budgets(
        &self,
        target_id: &str,
        user_id: &str,
        direction: AlertDirection,
        settings: &AlertSettings,
        now_ms: i64,
    ) -> Option<AlertSkipReason> {
        let caches = self.caches.lock().await;

        if caches
            .throttled
            .contains(&(target_id.to_string(), direction))
        {
            return Some(AlertSkipReason::Throttle);
        }

        if settings.hourly_alert_budget > 0 {
            let bucket = hour_bucket(now_ms);
            if let Some((b, count)) = caches.hourly.get(user_id) {
                if *b == bucket && *count >= settings.hourly_alert_budget {
                    return Some(AlertSkipReason::Throttle);
                }
            }
        }

        if settings.monthly_alert_budget > 0 {
            let bucket = month_bucket(now_ms);
            if let Some((b, count)) = caches.monthly.get(user_id) {
                if *b == bucket && *count >= settings.monthly_alert_budget {
                    return Some(AlertSkipReason::Throttle);
                }
            }
        }

        None
    }

    async fn record_delivery(
        &self,
        target_id: &str,
        user_id: &str,
        direction: AlertDirection,
        now_ms: i64,
    ) {
        let mut caches = self.caches.lock().await;
        caches.throttled.insert((target_id.to_string(), direction));

        let hour = hour_bucket(now_ms);
        let entry = caches.hourly.entry(user_id.to_string()).or_insert((hour, 0));
        if entry.0 != hour {
            *entry = (hour, 0);
        }
        entry.1 += 1;

        let month = month_bucket(now_ms);
        let entry = caches
            .monthly
            .entry(user_id.to_string())
            .or_insert((month, 0));
        if entry.0 != month {
            *entry = (month, 0);
        }
        entry.1 += 1;
    }
}

/// The alertable transitions. `previous == current` and `unknown → online`
/// never alert.
fn transition_direction(previous: TargetStatus, current: TargetStatus) -> Option<AlertDirection> {
    match (previous, current) {
        (TargetStatus::Unknown, TargetStatus::Offline)
        | (TargetStatus::Online, TargetStatus::Offline) => Some(AlertDirection::Down),
        (TargetStatus::Offline, TargetStatus::Online) => Some(AlertDirection::Up),
        _ => None,
    }
}

fn hour_bucket(now_ms: i64) -> i64 {
    now_ms / 3_600_000
}

fn month_bucket(now_ms: i64) -> (i32, u32) {
    use chrono::{Datelike, TimeZone, Utc};
    match Utc.timestamp_millis_opt(now_ms) {
        chrono::LocalResult::Single(dt) => (dt.year(), dt.month()),
        _ => (1970, 1),
    }
}
