//! Core types for the monitoring engine.
//!
//! Everything the scheduler, probe engine and sinks exchange lives here: the
//! target document (owned by the store, mutated through Sink B), the
//! ephemeral probe result, the telemetry row streamed to the warehouse, and
//! the sparse mutation update coalesced by Sink B.

use crate::config::Region;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel status code for connection-level failures.
pub const STATUS_CODE_CONNECTION_ERROR: i32 = 0;
/// Sentinel status code for probe timeouts.
pub const STATUS_CODE_TIMEOUT: i32 = -1;

/// Externally visible target status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Online,
    Offline,
    Disabled,
    /// Never probed, or status not yet determined.
    #[default]
    Unknown,
}

/// Four-way probe classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetailedStatus {
    Up,
    Redirect,
    ReachableWithError,
    Down,
}

/// Probe kind, derived from the target URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Http,
    Https,
    Tcp,
    Udp,
}

/// Framing defaults for HTTP targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    #[default]
    Website,
    RestEndpoint,
}

/// Response-body validator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BodyValidator {
    /// Every entry must appear (case-insensitively) in the body snippet.
    #[serde(default)]
    pub contains_text: Vec<String>,
    /// JSONPath expression; currently only gates on the body parsing as JSON.
    #[serde(default)]
    pub json_path: Option<String>,
    /// Expected value at `json_path`; carried but not yet evaluated.
    #[serde(default)]
    pub expected_value: Option<serde_json::Value>,
}

impl BodyValidator {
    pub fn is_configured(&self) -> bool {
        !self.contains_text.is_empty() || self.json_path.is_some()
    }
}

/// Resolved network/geo metadata for a target host.
///
/// Every field is optional: resolution is best-effort and partial results
/// are merged over whatever is already known (nulls never overwrite).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TargetMetadata {
    pub hostname: Option<String>,
    pub primary_ip: Option<String>,
    /// All resolved addresses, serialized as a JSON array on the document.
    #[serde(default)]
    pub ips: Vec<String>,
    /// "v4" or "v6" for the primary address.
    pub ip_family: Option<String>,
    pub country: Option<String>,
    pub region_name: Option<String>,
    pub city: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub asn: Option<u32>,
    pub org: Option<String>,
    pub isp: Option<String>,
}

impl TargetMetadata {
    /// Merge `newer` over `self`, keeping existing values where the newer
    /// lookup came back empty.
    pub fn merged_with(&self, newer: &TargetMetadata) -> TargetMetadata {
        TargetMetadata {
            hostname: newer.hostname.clone().or_else(|| self.hostname.clone()),
            primary_ip: newer.primary_ip.clone().or_else(|| self.primary_ip.clone()),
            ips: if newer.ips.is_empty() {
                self.ips.clone()
            } else {
                newer.ips.clone()
            },
            ip_family: newer.ip_family.clone().or_else(|| self.ip_family.clone()),
            country: newer.country.clone().or_else(|| self.country.clone()),
            region_name: newer.region_name.clone().or_else(|| self.region_name.clone()),
            city: newer.city.clone().or_else(|| self.city.clone()),
            lat: newer.lat.or(self.lat),
            lon: newer.lon.or(self.lon),
            asn: newer.asn.or(self.asn),
            org: newer.org.clone().or_else(|| self.org.clone()),
            isp: newer.isp.clone().or_else(|| self.isp.clone()),
        }
    }
}

/// SSL certificate snapshot persisted on the target document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SslCertSnapshot {
    pub issuer: Option<String>,
    pub subject: Option<String>,
    /// Not-after expiry, epoch milliseconds.
    pub not_after_ms: Option<i64>,
    pub fingerprint_sha256: Option<String>,
}

/// CDN/edge hints sniffed from response headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EdgeHints {
    /// CDN provider guess ("cloudflare", "fastly", ...).
    pub provider: Option<String>,
    /// Edge PoP code when the provider exposes one.
    pub pop: Option<String>,
    /// Request/ray id when the provider exposes one.
    pub ray_id: Option<String>,
    /// Relevant raw headers, serialized for the warehouse.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl EdgeHints {
    pub fn is_empty(&self) -> bool {
        self.provider.is_none() && self.pop.is_none() && self.ray_id.is_none()
    }
}

/// Per-stage timings of one HTTP exchange, milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct StageTimings {
    pub dns_ms: Option<u32>,
    pub connect_ms: Option<u32>,
    pub tls_ms: Option<u32>,
    pub ttfb_ms: Option<u32>,
    pub total_ms: u32,
}

/// A configured monitored endpoint. Owned by the target store; the
/// scheduler only reads it and writes sparse mutation updates back.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Target {
    pub id: String,
    pub user_id: String,
    pub url: String,
    #[serde(default)]
    pub name: String,
    /// Owning region; `None` means unassigned (probed by the canonical
    /// region until the first metadata lookup assigns one).
    #[serde(default)]
    pub region: Option<Region>,
    #[serde(default)]
    pub kind: TargetKind,
    /// Check interval in minutes; 0 falls back to the configured default.
    #[serde(default)]
    pub interval_minutes: u32,

    #[serde(default)]
    pub http_method: Option<String>,
    /// Expected status codes; empty means the classification rulebook applies.
    #[serde(default)]
    pub expected_status_codes: Vec<u16>,
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    #[serde(default)]
    pub request_body: Option<String>,
    #[serde(default)]
    pub validator: Option<BodyValidator>,
    #[serde(default)]
    pub response_time_limit_ms: Option<u32>,
    #[serde(default)]
    pub cache_no_cache: bool,

    #[serde(default)]
    pub status: TargetStatus,
    #[serde(default)]
    pub detailed_status: Option<DetailedStatus>,
    #[serde(default)]
    pub last_status_code: i32,
    #[serde(default)]
    pub last_response_time_ms: Option<u32>,
    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub consecutive_successes: u32,
    /// Set exactly while `consecutive_failures > 0`.
    #[serde(default)]
    pub first_failure_at: Option<i64>,

    #[serde(default)]
    pub last_checked_at: Option<i64>,
    #[serde(default)]
    pub next_check_at: i64,
    #[serde(default)]
    pub last_history_at: Option<i64>,

    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub disabled_reason: Option<String>,
    #[serde(default)]
    pub disabled_at: Option<i64>,

    /// Idempotence tokens for at-least-once alert delivery.
    #[serde(default)]
    pub pending_down_alert: bool,
    #[serde(default)]
    pub pending_up_alert: bool,
    #[serde(default)]
    pub pending_since: Option<i64>,

    #[serde(default)]
    pub metadata: Option<TargetMetadata>,
    #[serde(default)]
    pub metadata_checked_at: Option<i64>,
    #[serde(default)]
    pub ssl_cert: Option<SslCertSnapshot>,
    #[serde(default)]
    pub ssl_checked_at: Option<i64>,

    #[serde(default)]
    pub order_index: i64,
    /// Cached subscription tier, advisory only.
    #[serde(default)]
    pub tier: Option<String>,
}

impl Target {
    /// Probe kind derived from the URL scheme; defaults to HTTP when the
    /// URL does not parse (the probe itself will then report the error).
    pub fn probe_kind(&self) -> ProbeKind {
        match url::Url::parse(&self.url) {
            Ok(u) => match u.scheme() {
                "https" => ProbeKind::Https,
                "tcp" => ProbeKind::Tcp,
                "udp" => ProbeKind::Udp,
                _ => ProbeKind::Http,
            },
            Err(_) => ProbeKind::Http,
        }
    }

    /// Effective probe cadence in milliseconds.
    pub fn interval_ms(&self, default_minutes: u32) -> i64 {
        let minutes = if self.interval_minutes == 0 {
            default_minutes
        } else {
            self.interval_minutes
        };
        i64::from(minutes) * 60_000
    }
}

/// Outcome of exactly one probe. Ephemeral; never persisted as-is.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub status: TargetStatus,
    pub detailed: DetailedStatus,
    /// HTTP status, or a sentinel: 0 = connection error, -1 = timeout.
    pub status_code: i32,
    pub response_time_ms: u32,
    pub timings: Option<StageTimings>,
    /// First chunk of the response body, capped at the snippet limit.
    pub body_snippet: Option<String>,
    pub redirect_location: Option<String>,
    pub error: Option<String>,
    /// Metadata delta from the resolver, if a lookup ran.
    pub metadata: Option<TargetMetadata>,
    pub edge: Option<EdgeHints>,
    pub ssl_cert: Option<SslCertSnapshot>,
    /// Method that produced the final response (GET/HEAD/...).
    pub method_used: Option<String>,
    /// Whether the final response was produced with a `Range` header.
    pub range_used: bool,
}

impl ProbeResult {
    pub fn is_offline(&self) -> bool {
        self.status == TargetStatus::Offline
    }
}

static ROW_SEQ: AtomicU64 = AtomicU64::new(0);

/// One element of the telemetry stream into Sink A.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRow {
    /// `{target_id}:{timestamp_ms}:{seq}` — the monotonic sequence breaks
    /// ties between concurrent probes of the same target in one millisecond.
    pub id: String,
    pub target_id: String,
    pub user_id: String,
    pub timestamp_ms: i64,
    pub status: TargetStatus,
    pub detailed: DetailedStatus,
    pub status_code: i32,
    pub response_time_ms: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timings: Option<StageTimings>,
    #[serde(default)]
    pub metadata: Option<TargetMetadata>,
    #[serde(default)]
    pub edge: Option<EdgeHints>,
}

impl TelemetryRow {
    /// Build a row from a probe observation, assigning the unique id.
    pub fn from_probe(target: &Target, result: &ProbeResult, timestamp_ms: i64) -> Self {
        let seq = ROW_SEQ.fetch_add(1, Ordering::Relaxed);
        TelemetryRow {
            id: format!("{}:{}:{}", target.id, timestamp_ms, seq),
            target_id: target.id.clone(),
            user_id: target.user_id.clone(),
            timestamp_ms,
            status: result.status,
            detailed: result.detailed,
            status_code: result.status_code,
            response_time_ms: result.response_time_ms,
            error: result.error.clone(),
            timings: result.timings,
            metadata: result.metadata.clone(),
            edge: result.edge.clone(),
        }
    }
}

/// Field names recognized by `ApplyUpdates`. Mutation updates are sparse
/// maps keyed by these names; the store applies them onto the document.
pub mod fields {
    pub const STATUS: &str = "status";
    pub const DETAILED_STATUS: &str = "detailed_status";
    pub const LAST_STATUS_CODE: &str = "last_status_code";
    pub const LAST_RESPONSE_TIME_MS: &str = "last_response_time_ms";
    pub const LAST_ERROR: &str = "last_error";
    pub const CONSECUTIVE_FAILURES: &str = "consecutive_failures";
    pub const CONSECUTIVE_SUCCESSES: &str = "consecutive_successes";
    pub const FIRST_FAILURE_AT: &str = "first_failure_at";
    pub const LAST_CHECKED_AT: &str = "last_checked_at";
    pub const NEXT_CHECK_AT: &str = "next_check_at";
    pub const LAST_HISTORY_AT: &str = "last_history_at";
    pub const REGION: &str = "region";
    pub const DISABLED: &str = "disabled";
    pub const DISABLED_REASON: &str = "disabled_reason";
    pub const DISABLED_AT: &str = "disabled_at";
    pub const PENDING_DOWN_ALERT: &str = "pending_down_alert";
    pub const PENDING_UP_ALERT: &str = "pending_up_alert";
    pub const PENDING_SINCE: &str = "pending_since";
    pub const METADATA: &str = "metadata";
    pub const METADATA_CHECKED_AT: &str = "metadata_checked_at";
    pub const SSL_CERT: &str = "ssl_cert";
    pub const SSL_CHECKED_AT: &str = "ssl_checked_at";
}

/// One element of the mutation stream into Sink B: a sparse field map for
/// one target. Merged last-write-wins per field before flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationUpdate {
    pub target_id: String,
    pub fields: HashMap<String, serde_json::Value>,
}

impl MutationUpdate {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            fields: HashMap::new(),
        }
    }

    /// Set a field, serializing the value. Serialization of the field types
    /// used here is infallible; a failure would be a programming error, so
    /// it is ignored rather than propagated.
    pub fn set<T: Serialize>(&mut self, field: &str, value: T) -> &mut Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.fields.insert(field.to_string(), v);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Store-seam error. Probe-level network failures never use this; they are
/// folded into `ProbeResult`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(String),
    #[error("store rejected write: {0}")]
    Rejected(String),
}

/// Warehouse-seam error: a whole-batch failure without row indices.
#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("warehouse insert failed: {0}")]
    Insert(String),
    #[error("warehouse query failed: {0}")]
    Query(String),
}

/// Resolver-seam error.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("dns lookup failed: {0}")]
    Dns(String),
    #[error("geo lookup failed: {0}")]
    Geo(String),
    #[error("lookup timed out")]
    Timeout,
    #[error("invalid probe url: {0}")]
    InvalidUrl(String),
}

/// Tick-level error. Lock contention and budget exhaustion are not errors;
/// they surface in the tick outcome instead.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error(transparent)]
    Store(#[from] StoreError),
}
