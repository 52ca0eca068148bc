//! Recognized configuration set for the checker core.
//!
//! All knobs live on [`CheckerConfig`]: scheduling cadence, confirmation and
//! recheck windows, fan-out sizing, sink buffering/backoff parameters and the
//! lock/time-budget envelope. Defaults match production; every value can be
//! overridden from the environment via `from_env()` (strict parsing, invalid
//! values fall back to the default rather than aborting).

pub mod regions;

pub use regions::Region;

use std::time::Duration;

/// Configuration for the probe scheduler and its sinks.
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Default probe cadence when a target does not carry its own interval.
    pub check_interval_minutes: u32,

    /// Consecutive offline observations required before offline is reported
    /// externally.
    pub down_confirmation_attempts: u32,
    /// Wall-clock window (since first failure) inside which confirmation
    /// attempts are rechecked rapidly instead of declaring offline.
    pub down_confirmation_window_ms: i64,
    /// Delay before a confirmation recheck.
    pub immediate_recheck_delay_ms: i64,
    /// A new first failure only triggers an immediate recheck if the previous
    /// check is at least this old (guards against recheck loops).
    pub immediate_recheck_window_ms: i64,
    /// Master switch for immediate rechecks on a new first failure.
    pub immediate_recheck_enabled: bool,

    /// Heartbeat telemetry cadence while a target is steadily online.
    /// Buckets are epoch-milliseconds divided by this interval.
    pub history_sample_interval_ms: i64,

    /// Page size for the due-target query.
    pub max_websites_per_run: usize,
    /// Maximum pages pulled per tick.
    pub max_check_query_pages: usize,

    /// Base total probe timeout.
    pub probe_timeout_base_ms: u32,
    /// Hard ceiling on the adaptive probe timeout.
    pub probe_timeout_ceiling_ms: u32,
    /// Total timeout for TCP/UDP light checks.
    pub tcp_light_check_timeout_ms: u32,

    /// Sleep between probe waves inside one batch.
    pub concurrent_batch_delay_ms: u64,
    /// Sleep between batch groups.
    pub batch_delay_ms: u64,
    /// Upper bound for dynamic per-wave concurrency.
    pub max_concurrent_cap: usize,

    /// TTL on a target's stored metadata before a probe refreshes it.
    pub target_metadata_ttl_ms: i64,
    /// Retry interval after a failed metadata lookup.
    pub target_metadata_retry_ms: i64,
    /// TTL on the SSL certificate snapshot.
    pub security_metadata_ttl_ms: i64,
    /// TTL for entries in the resolver's per-IP geo cache.
    pub geo_cache_ttl_ms: i64,
    /// In-flight cap on resolver lookups; excess callers queue FIFO.
    pub resolver_max_in_flight: usize,
    /// Total timeout for one metadata resolution.
    pub resolver_timeout_ms: u64,

    /// User agent sent on HTTP probes.
    pub user_agent: String,
    /// Hard cap on the response-body snippet read per probe.
    pub body_snippet_max_bytes: usize,
    /// Independent timeout for reading the first body chunk.
    pub body_read_timeout_ms: u64,

    /// Tick envelope: the configured function timeout minus the safety
    /// buffer is the wall-clock budget for one tick.
    pub function_timeout_ms: u64,
    pub safety_buffer_ms: u64,
    /// Minimum remaining budget required to start a new wave.
    pub min_time_for_new_batch_ms: u64,

    /// Distributed lock TTL and heartbeat cadence.
    pub lock_ttl_ms: i64,
    pub lock_heartbeat_interval_ms: u64,

    /// Sink A (telemetry buffer) knobs.
    pub telemetry: TelemetryBufferConfig,

    /// Sink B (mutation batcher) knobs.
    pub mutation_flush_interval_ms: u64,
    pub mutation_drain_retries: u32,

    /// Auto-disable policy: a target is disabled instead of probed once it
    /// has been failing this hard for this long.
    pub disable_after_consecutive_failures: u32,
    pub disable_after_down_ms: i64,
}

/// Buffering, batching and retry knobs for the telemetry sink.
#[derive(Debug, Clone)]
pub struct TelemetryBufferConfig {
    pub max_buffer_size: usize,
    pub high_watermark: usize,
    pub flush_interval_ms: u64,
    pub default_flush_delay_ms: u64,
    pub watermark_flush_delay_ms: u64,
    pub max_batch_rows: usize,
    pub max_batch_bytes: usize,
    pub backoff_initial_ms: i64,
    pub backoff_max_ms: i64,
    pub max_failures_before_drop: u32,
    pub failure_timeout_ms: i64,
}

impl Default for TelemetryBufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 2000,
            high_watermark: 500,
            flush_interval_ms: 30_000,
            default_flush_delay_ms: 2_000,
            watermark_flush_delay_ms: 200,
            max_batch_rows: 400,
            max_batch_bytes: 9 * 1024 * 1024,
            backoff_initial_ms: 5_000,
            backoff_max_ms: 300_000,
            max_failures_before_drop: 10,
            failure_timeout_ms: 600_000,
        }
    }
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            check_interval_minutes: 5,
            down_confirmation_attempts: 3,
            down_confirmation_window_ms: 5 * 60_000,
            immediate_recheck_delay_ms: 30_000,
            immediate_recheck_window_ms: 120_000,
            immediate_recheck_enabled: true,
            history_sample_interval_ms: 60_000,
            max_websites_per_run: 500,
            max_check_query_pages: 5,
            probe_timeout_base_ms: 10_000,
            probe_timeout_ceiling_ms: 30_000,
            tcp_light_check_timeout_ms: 5_000,
            concurrent_batch_delay_ms: 500,
            batch_delay_ms: 1_000,
            max_concurrent_cap: 50,
            target_metadata_ttl_ms: 24 * 60 * 60_000,
            target_metadata_retry_ms: 60 * 60_000,
            security_metadata_ttl_ms: 24 * 60 * 60_000,
            geo_cache_ttl_ms: 24 * 60 * 60_000,
            resolver_max_in_flight: 20,
            resolver_timeout_ms: 10_000,
            user_agent: format!("watchgrid-probe/{}", env!("CARGO_PKG_VERSION")),
            body_snippet_max_bytes: 8_192,
            body_read_timeout_ms: 5_000,
            function_timeout_ms: 540_000,
            safety_buffer_ms: 30_000,
            min_time_for_new_batch_ms: 15_000,
            lock_ttl_ms: 25 * 60_000,
            lock_heartbeat_interval_ms: 60_000,
            telemetry: TelemetryBufferConfig::default(),
            mutation_flush_interval_ms: 10_000,
            mutation_drain_retries: 5,
            disable_after_consecutive_failures: 100,
            disable_after_down_ms: 30 * 24 * 60 * 60_000,
        }
    }
}

impl CheckerConfig {
    /// Defaults overlaid with `WATCHGRID_*` environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        override_u32(&mut cfg.check_interval_minutes, "WATCHGRID_CHECK_INTERVAL_MINUTES");
        override_u32(&mut cfg.down_confirmation_attempts, "WATCHGRID_DOWN_CONFIRMATION_ATTEMPTS");
        override_i64(&mut cfg.down_confirmation_window_ms, "WATCHGRID_DOWN_CONFIRMATION_WINDOW_MS");
        override_i64(&mut cfg.immediate_recheck_delay_ms, "WATCHGRID_IMMEDIATE_RECHECK_DELAY_MS");
        override_i64(&mut cfg.immediate_recheck_window_ms, "WATCHGRID_IMMEDIATE_RECHECK_WINDOW_MS");
        override_i64(&mut cfg.history_sample_interval_ms, "WATCHGRID_HISTORY_SAMPLE_INTERVAL_MS");
        override_usize(&mut cfg.max_websites_per_run, "WATCHGRID_MAX_WEBSITES_PER_RUN");
        override_usize(&mut cfg.max_check_query_pages, "WATCHGRID_MAX_CHECK_QUERY_PAGES");
        override_u32(&mut cfg.probe_timeout_base_ms, "WATCHGRID_PROBE_TIMEOUT_MS");
        override_u32(&mut cfg.tcp_light_check_timeout_ms, "WATCHGRID_TCP_LIGHT_CHECK_TIMEOUT_MS");
        override_u64(&mut cfg.concurrent_batch_delay_ms, "WATCHGRID_CONCURRENT_BATCH_DELAY_MS");
        override_u64(&mut cfg.batch_delay_ms, "WATCHGRID_BATCH_DELAY_MS");
        override_usize(&mut cfg.max_concurrent_cap, "WATCHGRID_MAX_CONCURRENT");
        override_u64(&mut cfg.function_timeout_ms, "WATCHGRID_FUNCTION_TIMEOUT_MS");
        override_u64(&mut cfg.safety_buffer_ms, "WATCHGRID_SAFETY_BUFFER_MS");
        if let Ok(ua) = std::env::var("WATCHGRID_USER_AGENT") {
            if !ua.trim().is_empty() {
                cfg.user_agent = ua;
            }
        }
        cfg.immediate_recheck_enabled =
            parse_env_bool_or("WATCHGRID_IMMEDIATE_RECHECK", cfg.immediate_recheck_enabled);
        cfg
    }

    /// Total probe timeout for one target.
    ///
    /// Starts from the base value, halved while a down-confirmation recheck
    /// is in progress, raised for targets whose configured response-time
    /// ceiling exceeds the base, and clamped to the ceiling.
    pub fn adaptive_timeout_ms(&self, response_time_limit_ms: Option<u32>, recheck: bool) -> u32 {
        let mut timeout = self.probe_timeout_base_ms;
        if recheck {
            timeout /= 2;
        }
        if let Some(limit) = response_time_limit_ms {
            if limit > timeout {
                timeout = limit.saturating_add(2_000);
            }
        }
        timeout.min(self.probe_timeout_ceiling_ms).max(1_000)
    }

    /// Batch size for partitioning one page of due targets.
    pub fn optimal_batch_size(&self, due: usize) -> usize {
        match due {
            0 => 1,
            1..=50 => due,
            51..=200 => 50,
            _ => 100,
        }
    }

    /// Per-wave probe concurrency, scaled to the amount of due work.
    pub fn dynamic_concurrency(&self, due: usize) -> usize {
        let scaled = (due / 4).max(5);
        scaled.min(self.max_concurrent_cap).max(1)
    }

    /// Parallel batch groups per tick.
    pub fn max_parallel_batches(&self, max_concurrent: usize) -> usize {
        max_concurrent.div_ceil(50).max(1)
    }

    /// Auto-disable predicate: consecutive failures past the cap, or a
    /// first-failure timestamp older than the downtime cap.
    pub fn should_disable(
        &self,
        consecutive_failures: u32,
        first_failure_at_ms: Option<i64>,
        now_ms: i64,
    ) -> bool {
        if consecutive_failures >= self.disable_after_consecutive_failures {
            return true;
        }
        match first_failure_at_ms {
            Some(first) if consecutive_failures > 0 => {
                now_ms.saturating_sub(first) >= self.disable_after_down_ms
            }
            _ => false,
        }
    }

    /// History bucket index for the heartbeat sampler.
    pub fn history_bucket(&self, epoch_ms: i64) -> i64 {
        epoch_ms / self.history_sample_interval_ms.max(1)
    }

    /// Wall-clock budget for one tick.
    pub fn tick_budget(&self) -> Duration {
        Duration::from_millis(self.function_timeout_ms.saturating_sub(self.safety_buffer_ms))
    }
}

/// Parse a boolean environment variable; only "true"/"false" (any case) are
/// recognized, anything else keeps the default.
pub fn parse_env_bool_or(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => match v.trim().to_lowercase().as_str() {
            "true" => true,
            "false" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn override_u32(slot: &mut u32, name: &str) {
    if let Some(v) = parse_env::<u32>(name) {
        *slot = v;
    }
}

fn override_u64(slot: &mut u64, name: &str) {
    if let Some(v) = parse_env::<u64>(name) {
        *slot = v;
    }
}

fn override_i64(slot: &mut i64, name: &str) {
    if let Some(v) = parse_env::<i64>(name) {
        *slot = v;
    }
}

fn override_usize(slot: &mut usize, name: &str) {
    if let Some(v) = parse_env::<usize>(name) {
        *slot = v;
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
