//! External collaborator ports.
//!
//! The scheduler core performs no direct store, warehouse or delivery I/O;
//! everything goes through these injected traits. Production adapters live
//! outside the core (see `adapters/`), tests inject scripted fakes.

use crate::config::Region;
use crate::core::types::{
    MutationUpdate, ResolveError, SslCertSnapshot, StoreError, Target, TargetStatus, TelemetryRow,
    WarehouseError,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Instant;

/// One page of due targets.
#[derive(Debug, Clone, Default)]
pub struct DuePage {
    pub targets: Vec<Target>,
    pub next_cursor: Option<String>,
    /// True when more due targets exist beyond this page.
    pub truncated: bool,
}

/// Outcome of a compare-and-set lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquire {
    Acquired,
    /// Unexpired lock held by another owner.
    Taken,
}

/// Outcome of a lock extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockExtend {
    Extended,
    /// Document exists but names a different owner.
    Stolen,
    /// Document disappeared.
    Missing,
}

/// Target store port: due-target paging, mutation writes and the
/// distributed lock document.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Page targets where `next_check_at <= now`, not disabled, in `region`.
    /// With `include_unassigned`, targets without a region are included
    /// (only the canonical region passes this).
    async fn page_due(
        &self,
        now_ms: i64,
        region: Region,
        include_unassigned: bool,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<DuePage, StoreError>;

    /// Apply sparse field updates, one entry per target.
    async fn apply_updates(&self, updates: Vec<MutationUpdate>) -> Result<(), StoreError>;

    /// Compare-and-set acquisition: succeeds when the document is absent,
    /// expired, or already owned by `owner`.
    async fn acquire_lock(
        &self,
        doc: &str,
        owner: &str,
        ttl_ms: i64,
    ) -> Result<LockAcquire, StoreError>;

    /// Extend the expiry; only valid for the current owner.
    async fn extend_lock(
        &self,
        doc: &str,
        owner: &str,
        ttl_ms: i64,
    ) -> Result<LockExtend, StoreError>;

    /// Conditional delete; no-op when `owner` no longer holds the lock.
    async fn release_lock(&self, doc: &str, owner: &str) -> Result<(), StoreError>;
}

/// Warehouse insert outcome. Whole-batch failures without row indices are
/// reported as `Err(WarehouseError)` instead.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Ok,
    /// Indices (into the submitted batch) of rows that failed.
    PartialFailure { indices: Vec<usize> },
}

/// Columnar warehouse port. Only `insert` is on the hot path.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn insert(
        &self,
        table: &str,
        rows: &[TelemetryRow],
    ) -> Result<InsertOutcome, WarehouseError>;

    async fn query(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>, WarehouseError>;
}

/// Best-effort geo data for one IP.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub region_name: Option<String>,
    pub city: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub asn: Option<u32>,
    pub org: Option<String>,
    pub isp: Option<String>,
}

/// GeoIP lookup port. Implementations are best-effort; any field may be
/// absent and errors are swallowed by the resolver.
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, ResolveError>;
}

/// Certificate snapshot port. The HTTP stack does not expose the peer
/// certificate, so snapshotting is its own best-effort lookup with its own
/// timeout budget.
#[async_trait]
pub trait CertFetcher: Send + Sync {
    async fn fetch(&self, host: &str, port: u16) -> Result<SslCertSnapshot, ResolveError>;
}

/// A cert fetcher that never produces a snapshot. Default wiring until an
/// environment provides a real one.
pub struct NoopCertFetcher;

#[async_trait]
impl CertFetcher for NoopCertFetcher {
    async fn fetch(&self, _host: &str, _port: u16) -> Result<SslCertSnapshot, ResolveError> {
        Err(ResolveError::Geo("certificate snapshots not configured".into()))
    }
}

/// Alert settings bundle resolved per user from the subscription system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSettings {
    /// Minimum consecutive same-direction events before an alert fires.
    pub min_consecutive_events: u32,
    pub email: Option<String>,
    pub sms: Option<String>,
    pub webhook_url: Option<String>,
    /// Per-user alert budget per hour; 0 disables the budget.
    pub hourly_alert_budget: u32,
    /// Per-user alert budget per calendar month; 0 disables the budget.
    pub monthly_alert_budget: u32,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            min_consecutive_events: 1,
            email: None,
            sms: None,
            webhook_url: None,
            hourly_alert_budget: 0,
            monthly_alert_budget: 0,
        }
    }
}

/// User-tier / subscription lookup port.
#[async_trait]
pub trait SubscriptionLookup: Send + Sync {
    async fn alert_settings(&self, user_id: &str, tier_hint: Option<&str>) -> AlertSettings;
}

/// Why an alert was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertSkipReason {
    /// Below the consecutive-event threshold.
    Flap,
    /// User settings exclude this alert.
    Settings,
    MissingRecipient,
    Throttle,
    /// Delivery declined without a specific reason.
    #[serde(rename = "none")]
    Unspecified,
    /// Transient delivery failure.
    Error,
}

impl AlertSkipReason {
    /// Reasons that keep the pending flag set for a later retry.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            AlertSkipReason::Flap | AlertSkipReason::Error | AlertSkipReason::Throttle
        )
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertOutcome {
    pub delivered: bool,
    pub reason: Option<AlertSkipReason>,
}

impl AlertOutcome {
    pub fn delivered() -> Self {
        Self {
            delivered: true,
            reason: None,
        }
    }

    pub fn skipped(reason: AlertSkipReason) -> Self {
        Self {
            delivered: false,
            reason: Some(reason),
        }
    }
}

/// Counters accompanying a transition alert.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionCounters {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

/// Delivery context passed through to the alert backends.
#[derive(Debug, Clone)]
pub struct AlertContext {
    pub region: Region,
    pub tick_id: String,
    /// True when this delivery retries a pending-flagged alert.
    pub pending_retry: bool,
}

/// Alert delivery port. Implementations fan out to email/SMS/webhook
/// backends; the scheduler only sees the aggregate outcome.
#[async_trait]
pub trait AlertPort: Send + Sync {
    async fn trigger_alert(
        &self,
        target: &Target,
        previous: TargetStatus,
        current: TargetStatus,
        counters: TransitionCounters,
        settings: &AlertSettings,
        context: &AlertContext,
    ) -> AlertOutcome;

    async fn trigger_ssl_alert(
        &self,
        target: &Target,
        cert: &SslCertSnapshot,
        context: &AlertContext,
    ) -> AlertOutcome;
}

/// Clock abstraction: monotonic instants for budgets, epoch milliseconds
/// for persisted timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn epoch_ms(&self) -> i64;
}

/// Production clock.
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn epoch_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}
