//! Stand-in implementations of the delivery-side ports for local runs.

use crate::core::ports::{
    AlertContext, AlertOutcome, AlertPort, AlertSettings, GeoInfo, GeoLookup, SubscriptionLookup,
    TransitionCounters,
};
use crate::core::types::{ResolveError, SslCertSnapshot, Target, TargetStatus};
use async_trait::async_trait;
use std::net::IpAddr;
use tracing::info;

/// Geo lookup that knows nothing; the resolver keeps DNS-derived fields.
pub struct NoopGeoLookup;

#[async_trait]
impl GeoLookup for NoopGeoLookup {
    async fn lookup(&self, _ip: IpAddr) -> Result<GeoInfo, ResolveError> {
        Ok(GeoInfo::default())
    }
}

/// Alert "delivery" that logs and reports success. Good enough to watch
/// the pending-flag protocol work end to end locally.
pub struct LogAlertPort;

#[async_trait]
impl AlertPort for LogAlertPort {
    async fn trigger_alert(
        &self,
        target: &Target,
        previous: TargetStatus,
        current: TargetStatus,
        counters: TransitionCounters,
        _settings: &AlertSettings,
        context: &AlertContext,
    ) -> AlertOutcome {
        info!(
            target_id = %target.id,
            url = %target.url,
            ?previous,
            ?current,
            failures = counters.consecutive_failures,
            tick_id = %context.tick_id,
            pending_retry = context.pending_retry,
            "ALERT"
        );
        AlertOutcome::delivered()
    }

    async fn trigger_ssl_alert(
        &self,
        target: &Target,
        cert: &SslCertSnapshot,
        _context: &AlertContext,
    ) -> AlertOutcome {
        info!(
            target_id = %target.id,
            fingerprint = ?cert.fingerprint_sha256,
            not_after_ms = ?cert.not_after_ms,
            "SSL ALERT"
        );
        AlertOutcome::delivered()
    }
}

/// Fixed alert settings for every user.
pub struct StaticSubscriptionLookup {
    settings: AlertSettings,
}

impl StaticSubscriptionLookup {
    pub fn new(settings: AlertSettings) -> Self {
        Self { settings }
    }
}

impl Default for StaticSubscriptionLookup {
    fn default() -> Self {
        Self::new(AlertSettings {
            email: Some("ops@localhost".to_string()),
            ..AlertSettings::default()
        })
    }
}

#[async_trait]
impl SubscriptionLookup for StaticSubscriptionLookup {
    async fn alert_settings(&self, _user_id: &str, _tier_hint: Option<&str>) -> AlertSettings {
        self.settings.clone()
    }
}
