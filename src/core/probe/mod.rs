//! Probe engine: one probe against one target, no retries.
//!
//! Confirmation and retry policy belong to the scheduler; the engine's job
//! is a single classified observation. It performs no store or warehouse
//! I/O. Per-target options are passed explicitly, never read from ambient
//! state.

pub mod classify;
mod http;
mod tcp;
pub mod transport;
mod udp;

use crate::config::CheckerConfig;
use crate::core::ports::CertFetcher;
use crate::core::resolver::MetadataResolver;
use crate::core::types::{ProbeKind, ProbeResult, Target, TargetKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub use transport::{HttpTransport, IsahcTransport, TransportError, TransportErrorKind};

/// Explicit per-probe options, assembled by the scheduler from the target
/// document and the adaptive-timeout policy.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Total probe timeout across all fallback exchanges.
    pub timeout_ms: u32,
    pub method: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub validator: Option<crate::core::types::BodyValidator>,
    pub expected_status_codes: Vec<u16>,
    pub response_time_limit_ms: Option<u32>,
    pub cache_no_cache: bool,
    pub kind: TargetKind,
    /// Run the metadata resolver for this probe.
    pub refresh_metadata: bool,
    /// Refresh the SSL certificate snapshot (HTTPS targets only).
    pub refresh_ssl: bool,
    /// True while the scheduler reprobes to confirm a down state.
    pub recheck: bool,
}

impl ProbeOptions {
    /// Options for a target under the given policy flags.
    pub fn for_target(
        target: &Target,
        cfg: &CheckerConfig,
        recheck: bool,
        refresh_metadata: bool,
        refresh_ssl: bool,
    ) -> Self {
        let timeout_ms = match target.probe_kind() {
            ProbeKind::Tcp | ProbeKind::Udp => cfg.tcp_light_check_timeout_ms,
            _ => cfg.adaptive_timeout_ms(target.response_time_limit_ms, recheck),
        };
        Self {
            timeout_ms,
            method: target.http_method.clone(),
            headers: target.request_headers.clone(),
            body: target.request_body.clone(),
            validator: target.validator.clone(),
            expected_status_codes: target.expected_status_codes.clone(),
            response_time_limit_ms: target.response_time_limit_ms,
            cache_no_cache: target.cache_no_cache,
            kind: target.kind,
            refresh_metadata,
            refresh_ssl,
            recheck,
        }
    }
}

/// The probe engine. Owns the HTTP transport and the metadata resolver;
/// both are injectable for tests.
pub struct ProbeEngine {
    transport: Box<dyn HttpTransport>,
    resolver: Arc<MetadataResolver>,
    certs: Box<dyn CertFetcher>,
    cfg: Arc<CheckerConfig>,
}

impl ProbeEngine {
    pub fn new(
        transport: Box<dyn HttpTransport>,
        resolver: Arc<MetadataResolver>,
        certs: Box<dyn CertFetcher>,
        cfg: Arc<CheckerConfig>,
    ) -> Self {
        Self {
            transport,
            resolver,
            certs,
            cfg,
        }
    }

    /// Perform exactly one probe and classify the outcome.
    pub async fn probe(&self, target: &Target, opts: &ProbeOptions) -> ProbeResult {
        let kind = target.probe_kind();
        let mut result = match kind {
            ProbeKind::Http | ProbeKind::Https => {
                http::probe_http(self.transport.as_ref(), &self.cfg, &target.url, opts).await
            }
            ProbeKind::Tcp => tcp::probe_tcp(&target.url, opts.timeout_ms).await,
            ProbeKind::Udp => udp::probe_udp(&target.url, opts.timeout_ms).await,
        };

        if opts.refresh_metadata {
            match self.resolver.resolve(&target.url).await {
                Ok(resolved) => {
                    let merged = match &target.metadata {
                        Some(existing) => existing.merged_with(&resolved),
                        None => resolved,
                    };
                    result.metadata = Some(merged);
                }
                Err(e) => {
                    debug!(target_id = %target.id, error = %e, "metadata resolution failed");
                }
            }
        }

        if opts.refresh_ssl && kind == ProbeKind::Https {
            if let Ok((host, port)) = parse_host_port(&target.url) {
                let budget = Duration::from_millis(self.cfg.resolver_timeout_ms);
                match tokio::time::timeout(budget, self.certs.fetch(&host, port)).await {
                    Ok(Ok(cert)) => result.ssl_cert = Some(cert),
                    Ok(Err(e)) => {
                        debug!(target_id = %target.id, error = %e, "cert snapshot failed");
                    }
                    Err(_) => {
                        debug!(target_id = %target.id, "cert snapshot timed out");
                    }
                }
            }
        }

        result
    }
}

/// Parse `host` and `port` out of a probe URL. The port must be explicit
/// for tcp/udp schemes and lie in [1, 65535]; HTTPS defaults to 443.
pub(crate) fn parse_host_port(raw: &str) -> Result<(String, u16), String> {
    let parsed = url::Url::parse(raw).map_err(|e| format!("invalid URL {raw:?}: {e}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| format!("URL {raw:?} has no host"))?
        .to_string();
    let port = match parsed.port() {
        Some(0) => return Err(format!("URL {raw:?} has invalid port 0")),
        Some(p) => p,
        None => match parsed.scheme() {
            "https" => 443,
            "http" => 80,
            _ => return Err(format!("URL {raw:?} has no port")),
        },
    };
    Ok((host, port))
}
