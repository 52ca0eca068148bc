//! HTTP transport abstraction for probe execution.
//!
//! The probe state machine talks to a [`HttpTransport`] so tests can script
//! responses; production uses [`IsahcTransport`], a curl-backed client with
//! per-request metrics for the DNS/connect/TLS/TTFB stage breakdown.
//! Redirects are never followed; 3xx responses come back verbatim.

use crate::core::types::StageTimings;
use async_trait::async_trait;
use futures::AsyncReadExt;
use isahc::config::{Configurable, RedirectPolicy};
use isahc::{HttpClient, Request, ResponseExt};
use std::time::{Duration, Instant};

/// Probe stages, used for timing attribution and timeout labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStage {
    Dns,
    Connect,
    Tls,
    Ttfb,
}

impl ProbeStage {
    pub fn label(self) -> &'static str {
        match self {
            ProbeStage::Dns => "dns",
            ProbeStage::Connect => "connect",
            ProbeStage::Tls => "tls",
            ProbeStage::Ttfb => "ttfb",
        }
    }
}

/// Low-level failure classes surfaced by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Timeout,
    /// Malformed response / HTTP parse failure.
    Protocol,
    Io,
    Other,
}

impl TransportErrorKind {
    /// Stage a failure of this kind is attributed to. Connect-phase
    /// timeouts surface as `Connect` from curl; a plain timeout means the
    /// exchange died waiting for the first byte.
    pub fn stage(self) -> ProbeStage {
        match self {
            TransportErrorKind::Dns => ProbeStage::Dns,
            TransportErrorKind::Connect => ProbeStage::Connect,
            TransportErrorKind::Tls => ProbeStage::Tls,
            _ => ProbeStage::Ttfb,
        }
    }

    /// Failure classes eligible for the HTTP→HTTPS upgrade retry:
    /// connection refused/reset, unreachable host, DNS failure, timeout,
    /// broken pipe and HTTP parse errors.
    pub fn allows_https_upgrade(self) -> bool {
        matches!(
            self,
            TransportErrorKind::Dns
                | TransportErrorKind::Connect
                | TransportErrorKind::Timeout
                | TransportErrorKind::Io
                | TransportErrorKind::Protocol
        )
    }
}

/// Transport-level error with its raw message.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One HTTP exchange to perform.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Total timeout for the exchange up to response headers.
    pub timeout_ms: u32,
    /// Hard cap on the body snippet; cumulative-bytes guarded, the
    /// advertised Content-Length is not trusted.
    pub body_cap: usize,
    /// Independent timeout for reading the first body chunk.
    pub body_read_timeout_ms: u64,
    /// False for HEAD-style exchanges with no body to read.
    pub read_body: bool,
}

/// Response view handed back to the state machine.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub body_truncated: bool,
    pub timings: StageTimings,
}

impl TransportResponse {
    /// First header value matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP transport seam; injected for testing.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// Production transport backed by isahc.
pub struct IsahcTransport {
    client: HttpClient,
}

impl IsahcTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = HttpClient::builder()
            .redirect_policy(RedirectPolicy::None)
            .metrics(true)
            .build()
            .map_err(|e| {
                TransportError::new(
                    TransportErrorKind::Other,
                    format!("failed to create HTTP client: {e}"),
                )
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for IsahcTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let started = Instant::now();

        let mut builder = Request::builder()
            .method(request.method.as_str())
            .uri(&request.url)
            .timeout(Duration::from_millis(u64::from(request.timeout_ms)));

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let req = builder
            .body(request.body.unwrap_or_default())
            .map_err(|e| {
                TransportError::new(
                    TransportErrorKind::Protocol,
                    format!("request construction failed: {e}"),
                )
            })?;

        let response = self
            .client
            .send_async(req)
            .await
            .map_err(map_isahc_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let mut timings = stage_timings(response.metrics());

        let (body, body_truncated) = if request.read_body {
            read_capped_body(
                response.into_body(),
                request.body_cap,
                Duration::from_millis(request.body_read_timeout_ms),
            )
            .await
        } else {
            (Vec::new(), false)
        };

        timings.total_ms = started.elapsed().as_millis() as u32;

        Ok(TransportResponse {
            status,
            headers,
            body,
            body_truncated,
            timings,
        })
    }
}

/// Read at most `cap` bytes of the body, giving up after `timeout`.
/// A slow or endless body yields whatever arrived in time; the cumulative
/// counter is the authority, not Content-Length.
async fn read_capped_body(
    mut body: isahc::AsyncBody,
    cap: usize,
    timeout: Duration,
) -> (Vec<u8>, bool) {
    let mut collected = Vec::with_capacity(cap.min(2048));
    let mut chunk = [0u8; 2048];
    let mut truncated = false;

    let read_loop = async {
        loop {
            let remaining = cap.saturating_sub(collected.len());
            if remaining == 0 {
                truncated = true;
                break;
            }
            let want = remaining.min(chunk.len());
            match body.read(&mut chunk[..want]).await {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
    };

    // Body-read expiry is not a probe failure: validation sees the partial
    // snippet that made it in time.
    let _ = tokio::time::timeout(timeout, read_loop).await;
    (collected, truncated)
}

/// Stage durations from curl's transfer metrics. Phases are cumulative in
/// curl; the per-stage values are the deltas.
fn stage_timings(metrics: Option<&isahc::Metrics>) -> StageTimings {
    let Some(metrics) = metrics else {
        return StageTimings::default();
    };

    let dns = metrics.name_lookup_time();
    let connect = metrics.connect_time();
    let tls = metrics.secure_connect_time();
    let ttfb = metrics.transfer_start_time();

    let dns_ms = dns.as_millis() as u32;
    let connect_ms = connect.saturating_sub(dns).as_millis() as u32;
    let tls_done = if tls > Duration::ZERO { tls } else { connect };
    let tls_ms = tls.checked_sub(connect).map(|d| d.as_millis() as u32);
    let ttfb_ms = ttfb.saturating_sub(tls_done).as_millis() as u32;

    StageTimings {
        dns_ms: Some(dns_ms),
        connect_ms: Some(connect_ms),
        tls_ms,
        ttfb_ms: Some(ttfb_ms),
        total_ms: metrics.total_time().as_millis() as u32,
    }
}

fn map_isahc_error(error: isahc::Error) -> TransportError {
    use isahc::error::ErrorKind;

    let kind = match error.kind() {
        ErrorKind::NameResolution => TransportErrorKind::Dns,
        ErrorKind::ConnectionFailed => TransportErrorKind::Connect,
        ErrorKind::TlsEngine | ErrorKind::BadServerCertificate | ErrorKind::BadClientCertificate => {
            TransportErrorKind::Tls
        }
        ErrorKind::Timeout => TransportErrorKind::Timeout,
        ErrorKind::ProtocolViolation | ErrorKind::InvalidContentEncoding => {
            TransportErrorKind::Protocol
        }
        ErrorKind::Io => TransportErrorKind::Io,
        _ => TransportErrorKind::Other,
    };

    TransportError::new(kind, error.to_string())
}
