//! The per-region tick orchestrator.
//!
//! One tick: take the region lock, page due targets, fan probes out in
//! bounded waves, drive the transition state machine, feed Sink A
//! (telemetry) and Sink B (mutations), and defer whatever the wall-clock
//! budget does not cover. Lock contention and budget exhaustion are normal
//! outcomes, not errors; no single probe failure can fail the tick.

pub mod budget;
pub mod lock;
pub mod transition;

use crate::config::{CheckerConfig, Region};
use crate::core::alert::AlertGate;
use crate::core::mutations::MutationBatcher;
use crate::core::ports::{
    AlertContext, Clock, SubscriptionLookup, TargetStore, TransitionCounters,
};
use crate::core::probe::{ProbeEngine, ProbeOptions};
use crate::core::shutdown::ShutdownSignal;
use crate::core::telemetry::TelemetryBuffer;
use crate::core::types::{
    fields, MutationUpdate, ProbeKind, Target, TargetStatus, TelemetryRow, TickError,
};
use budget::TickBudget;
use lock::RegionLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use transition::{build_mutation, plan_transition, AlertPlan};
use uuid::Uuid;

/// Days of certificate validity left below which an SSL alert fires.
const SSL_EXPIRY_ALERT_WINDOW_MS: i64 = 14 * 24 * 60 * 60_000;

/// Why a tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickLockStatus {
    Held,
    /// Another tick owns the region; nothing was probed.
    Busy,
    /// The heartbeat lost the lock mid-tick; scheduling stopped early.
    LostMidTick,
}

/// Summary of one tick.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub region: Region,
    pub tick_id: String,
    pub lock: TickLockStatus,
    pub pages: usize,
    pub probed: usize,
    pub transitions: usize,
    pub disabled: usize,
    /// Due targets left for the next tick (budget, shutdown or lock loss).
    pub deferred: usize,
    pub elapsed_ms: u64,
}

#[derive(Default)]
struct TickCounters {
    probed: AtomicUsize,
    transitions: AtomicUsize,
    disabled: AtomicUsize,
    deferred: AtomicUsize,
}

/// The region scheduler. One instance drives any number of sequential
/// ticks; each tick is scoped to a single region.
pub struct Scheduler {
    store: Arc<dyn TargetStore>,
    engine: Arc<ProbeEngine>,
    telemetry: Arc<TelemetryBuffer>,
    mutations: Arc<MutationBatcher>,
    alerts: Arc<AlertGate>,
    subscriptions: Arc<dyn SubscriptionLookup>,
    clock: Arc<dyn Clock>,
    cfg: Arc<CheckerConfig>,
    shutdown: Arc<ShutdownSignal>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TargetStore>,
        engine: Arc<ProbeEngine>,
        telemetry: Arc<TelemetryBuffer>,
        mutations: Arc<MutationBatcher>,
        alerts: Arc<AlertGate>,
        subscriptions: Arc<dyn SubscriptionLookup>,
        clock: Arc<dyn Clock>,
        cfg: Arc<CheckerConfig>,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            store,
            engine,
            telemetry,
            mutations,
            alerts,
            subscriptions,
            clock,
            cfg,
            shutdown,
        }
    }

    /// Drive one tick for `region`.
    pub async fn run_tick(&self, region: Region) -> Result<TickOutcome, TickError> {
        let tick_id = Uuid::new_v4().to_string();
        let started = self.clock.now();

        let Some(region_lock) =
            RegionLock::acquire(Arc::clone(&self.store), region, self.cfg.lock_ttl_ms).await?
        else {
            info!(%region, %tick_id, "region lock taken, skipping tick");
            return Ok(TickOutcome {
                region,
                tick_id,
                lock: TickLockStatus::Busy,
                pages: 0,
                probed: 0,
                transitions: 0,
                disabled: 0,
                deferred: 0,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        };

        let heartbeat = tokio::spawn(Arc::clone(&region_lock).heartbeat(
            Duration::from_millis(self.cfg.lock_heartbeat_interval_ms),
            Arc::clone(&self.shutdown),
        ));

        self.alerts.begin_tick().await;

        let tick_budget = TickBudget::start(
            self.cfg.tick_budget(),
            Duration::from_millis(self.cfg.min_time_for_new_batch_ms),
        );
        let counters = TickCounters::default();
        let context = AlertContext {
            region,
            tick_id: tick_id.clone(),
            pending_retry: false,
        };

        let mut pages = 0usize;
        let mut cursor: Option<String> = None;
        let include_unassigned = region == Region::canonical();

        for _ in 0..self.cfg.max_check_query_pages {
            if self.stop_scheduling(&region_lock, &tick_budget) {
                break;
            }
            let now_ms = self.clock.epoch_ms();
            let page = self
                .store
                .page_due(
                    now_ms,
                    region,
                    include_unassigned,
                    cursor.clone(),
                    self.cfg.max_websites_per_run,
                )
                .await?;

            // Unassigned targets ride along only in the canonical region;
            // anything that somehow carries a foreign region tag is not ours.
            let targets: Vec<Target> = page
                .targets
                .into_iter()
                .filter(|t| t.region.is_none() || t.region == Some(region))
                .collect();

            if targets.is_empty() && !page.truncated {
                break;
            }
            pages += 1;

            self.process_page(targets, &region_lock, &tick_budget, &counters, &context)
                .await;

            cursor = page.next_cursor;
            if !page.truncated {
                break;
            }
        }

        // End-of-tick flush; failed updates stay queued for the periodic
        // flush or the next tick.
        self.mutations.flush().await;

        heartbeat.abort();
        region_lock.release().await;

        let lock_status = if region_lock.is_lost() {
            TickLockStatus::LostMidTick
        } else {
            TickLockStatus::Held
        };

        let outcome = TickOutcome {
            region,
            tick_id,
            lock: lock_status,
            pages,
            probed: counters.probed.load(Ordering::Relaxed),
            transitions: counters.transitions.load(Ordering::Relaxed),
            disabled: counters.disabled.load(Ordering::Relaxed),
            deferred: counters.deferred.load(Ordering::Relaxed),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            region = %outcome.region,
            tick_id = %outcome.tick_id,
            probed = outcome.probed,
            transitions = outcome.transitions,
            deferred = outcome.deferred,
            elapsed_ms = outcome.elapsed_ms,
            "tick finished"
        );
        Ok(outcome)
    }

    fn stop_scheduling(&self, region_lock: &RegionLock, tick_budget: &TickBudget) -> bool {
        self.shutdown.is_triggered() || region_lock.is_lost() || !tick_budget.should_start_work()
    }

    /// Partition one page into batches and run batch groups in parallel,
    /// each batch in waves of at most `max_concurrent` probes.
    async fn process_page(
        &self,
        targets: Vec<Target>,
        region_lock: &Arc<RegionLock>,
        tick_budget: &TickBudget,
        counters: &TickCounters,
        context: &AlertContext,
    ) {
        let due = targets.len();
        let max_concurrent = self.cfg.dynamic_concurrency(due);
        let batch_size = self.cfg.optimal_batch_size(due);
        let parallel_batches = self.cfg.max_parallel_batches(max_concurrent);
        let gate = Arc::new(Semaphore::new(max_concurrent));

        debug!(
            due,
            max_concurrent, batch_size, parallel_batches, "page fan-out computed"
        );

        let batches: Vec<Vec<Target>> = targets
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();

        let mut groups = batches.chunks(parallel_batches.max(1)).peekable();
        while let Some(group) = groups.next() {
            if self.stop_scheduling(region_lock, tick_budget) {
                let remaining: usize = group.iter().map(Vec::len).sum::<usize>()
                    + groups.map(|g| g.iter().map(Vec::len).sum::<usize>()).sum::<usize>();
                counters.deferred.fetch_add(remaining, Ordering::Relaxed);
                return;
            }

            futures::future::join_all(group.iter().map(|batch| {
                self.process_batch(
                    batch.clone(),
                    max_concurrent,
                    Arc::clone(&gate),
                    region_lock,
                    tick_budget,
                    counters,
                    context,
                )
            }))
            .await;

            if groups.peek().is_some() {
                tokio::time::sleep(Duration::from_millis(self.cfg.batch_delay_ms)).await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_batch(
        &self,
        batch: Vec<Target>,
        max_concurrent: usize,
        gate: Arc<Semaphore>,
        region_lock: &Arc<RegionLock>,
        tick_budget: &TickBudget,
        counters: &TickCounters,
        context: &AlertContext,
    ) {
        let mut waves = batch.chunks(max_concurrent.max(1)).peekable();
        while let Some(wave) = waves.next() {
            if self.stop_scheduling(region_lock, tick_budget) {
                let remaining: usize = wave.len()
                    + waves.map(<[Target]>::len).sum::<usize>();
                counters.deferred.fetch_add(remaining, Ordering::Relaxed);
                return;
            }

            futures::future::join_all(wave.iter().map(|target| {
                let gate = Arc::clone(&gate);
                async move {
                    // Permits bound overlap between parallel batch groups;
                    // the semaphore is never closed.
                    let Ok(_permit) = gate.acquire().await else {
                        return;
                    };
                    self.process_target(target.clone(), counters, context).await;
                }
            }))
            .await;

            if waves.peek().is_some() {
                tokio::time::sleep(Duration::from_millis(self.cfg.concurrent_batch_delay_ms))
                    .await;
            }
        }
    }

    /// Probe one target and apply the full transition pipeline.
    async fn process_target(
        &self,
        target: Target,
        counters: &TickCounters,
        context: &AlertContext,
    ) {
        let now_ms = self.clock.epoch_ms();

        if self.cfg.should_disable(
            target.consecutive_failures,
            target.first_failure_at,
            now_ms,
        ) {
            self.disable_target(&target, now_ms, context).await;
            counters.disabled.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let refresh_metadata = match target.metadata_checked_at {
            None => true,
            Some(checked) => {
                now_ms - checked >= self.cfg.target_metadata_ttl_ms
                    || (target.metadata.is_none()
                        && now_ms - checked >= self.cfg.target_metadata_retry_ms)
            }
        };
        let refresh_ssl = target.probe_kind() == ProbeKind::Https
            && match target.ssl_checked_at {
                None => true,
                Some(checked) => now_ms - checked >= self.cfg.security_metadata_ttl_ms,
            };
        let recheck = target.consecutive_failures > 0;

        let opts = ProbeOptions::for_target(&target, &self.cfg, recheck, refresh_metadata, refresh_ssl);
        let observed = self.engine.probe(&target, &opts).await;
        counters.probed.fetch_add(1, Ordering::Relaxed);

        let now_ms = self.clock.epoch_ms();
        let pending_status = self.mutations.pending_status(&target.id).await;
        let plan = plan_transition(&target, &observed, now_ms, pending_status, &self.cfg);

        debug!(
            target_id = %target.id,
            status = ?observed.status,
            code = observed.status_code,
            reported = ?plan.reported_status,
            phase = ?plan.phase,
            "probe processed"
        );

        if plan.emit_telemetry {
            self.telemetry
                .enqueue(TelemetryRow::from_probe(&target, &observed, now_ms))
                .await;
        }

        let mut mutation =
            build_mutation(&target, &observed, &plan, now_ms, refresh_metadata, refresh_ssl);

        if plan.reported_status != plan.previous_status {
            counters.transitions.fetch_add(1, Ordering::Relaxed);
        }

        self.apply_alert_plan(&target, &plan, &mut mutation, now_ms, context)
            .await;
        self.maybe_ssl_alert(&target, &observed, context).await;

        self.mutations.enqueue(mutation).await;
    }

    /// Run the alert action from the plan and fold the pending-flag
    /// protocol into the mutation.
    async fn apply_alert_plan(
        &self,
        target: &Target,
        plan: &transition::TransitionPlan,
        mutation: &mut MutationUpdate,
        now_ms: i64,
        context: &AlertContext,
    ) {
        let counters = TransitionCounters {
            consecutive_failures: plan.consecutive_failures,
            consecutive_successes: plan.consecutive_successes,
        };

        match plan.alert {
            Some(AlertPlan::Transition { previous, current }) => {
                // A genuine flip clears both idempotence tokens before the
                // delivery attempt.
                mutation.set(fields::PENDING_DOWN_ALERT, false);
                mutation.set(fields::PENDING_UP_ALERT, false);
                mutation.set(fields::PENDING_SINCE, None::<i64>);

                let settings = self
                    .subscriptions
                    .alert_settings(&target.user_id, target.tier.as_deref())
                    .await;
                let outcome = self
                    .alerts
                    .notify_transition(target, previous, current, counters, &settings, context, now_ms)
                    .await;

                if !outcome.delivered && outcome.reason.is_some_and(|r| r.is_retryable()) {
                    let flag = match current {
                        TargetStatus::Offline => fields::PENDING_DOWN_ALERT,
                        _ => fields::PENDING_UP_ALERT,
                    };
                    mutation.set(flag, true);
                    mutation.set(fields::PENDING_SINCE, now_ms);
                    debug!(
                        target_id = %target.id,
                        reason = ?outcome.reason,
                        "alert delivery deferred, pending flag set"
                    );
                }
            }
            Some(AlertPlan::PendingRetry { direction }) => {
                let settings = self
                    .subscriptions
                    .alert_settings(&target.user_id, target.tier.as_deref())
                    .await;
                let retry_context = AlertContext {
                    pending_retry: true,
                    ..context.clone()
                };
                let outcome = self
                    .alerts
                    .retry_pending(target, direction, counters, &settings, &retry_context, now_ms)
                    .await;

                if outcome.delivered {
                    let flag = match direction {
                        crate::core::alert::AlertDirection::Down => fields::PENDING_DOWN_ALERT,
                        crate::core::alert::AlertDirection::Up => fields::PENDING_UP_ALERT,
                    };
                    mutation.set(flag, false);
                    mutation.set(fields::PENDING_SINCE, None::<i64>);
                }
            }
            None => {}
        }
    }

    /// SSL alert when a fresh snapshot shows a changed or soon-expiring
    /// certificate.
    async fn maybe_ssl_alert(
        &self,
        target: &Target,
        observed: &crate::core::types::ProbeResult,
        context: &AlertContext,
    ) {
        let Some(cert) = &observed.ssl_cert else {
            return;
        };
        let now_ms = self.clock.epoch_ms();

        let changed = match (&target.ssl_cert, &cert.fingerprint_sha256) {
            (Some(old), Some(new_fp)) => old.fingerprint_sha256.as_ref() != Some(new_fp),
            _ => false,
        };
        let expiring = cert
            .not_after_ms
            .is_some_and(|not_after| not_after - now_ms < SSL_EXPIRY_ALERT_WINDOW_MS);

        if changed || expiring {
            let outcome = self.alerts.notify_ssl(target, cert, context).await;
            if !outcome.delivered {
                debug!(target_id = %target.id, reason = ?outcome.reason, "ssl alert not delivered");
            }
        }
    }

    /// Emit the disable mutation and notify the alert side.
    async fn disable_target(&self, target: &Target, now_ms: i64, context: &AlertContext) {
        warn!(
            target_id = %target.id,
            consecutive_failures = target.consecutive_failures,
            "auto-disabling target"
        );

        let mut mutation = MutationUpdate::new(&target.id);
        mutation.set(fields::DISABLED, true);
        mutation.set(
            fields::DISABLED_REASON,
            format!(
                "auto-disabled after {} consecutive failures",
                target.consecutive_failures
            ),
        );
        mutation.set(fields::DISABLED_AT, now_ms);
        mutation.set(fields::STATUS, TargetStatus::Disabled);
        mutation.set(fields::LAST_CHECKED_AT, now_ms);
        self.mutations.enqueue(mutation).await;

        let settings = self
            .subscriptions
            .alert_settings(&target.user_id, target.tier.as_deref())
            .await;
        let _ = self
            .alerts
            .notify_disabled(target, target.status, &settings, context)
            .await;
    }
}
