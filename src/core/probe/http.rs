//! HTTP(S) probe state machine.
//!
//! One probe performs up to a handful of exchanges against a single target:
//!
//! - a GET with `Range: bytes=0-0` when no body validator needs the payload,
//! - a retry without the range header when the server rejects ranges,
//! - a HEAD retry when the method itself is rejected (405/501),
//! - a single HTTPS-upgrade retry when a plain-HTTP exchange dies with a
//!   connection-level error.
//!
//! A single adaptive total timeout spans all exchanges; on expiry the error
//! names the stage that was active. Redirects are never followed; 3xx
//! responses are classified verbatim with the Location header captured.

use crate::config::CheckerConfig;
use crate::core::probe::classify::classify_response;
use crate::core::probe::transport::{
    HttpTransport, TransportError, TransportErrorKind, TransportRequest, TransportResponse,
};
use crate::core::probe::ProbeOptions;
use crate::core::types::{
    DetailedStatus, EdgeHints, ProbeResult, TargetKind, TargetStatus,
    STATUS_CODE_CONNECTION_ERROR, STATUS_CODE_TIMEOUT,
};
use std::collections::HashMap;
use std::time::Instant;

/// Statuses after which a ranged GET is retried without the range header.
const RANGE_REJECT_CODES: [u16; 6] = [400, 403, 405, 406, 416, 501];
/// Statuses after which a plain GET is retried as HEAD.
const METHOD_REJECT_CODES: [u16; 2] = [405, 501];

pub(super) async fn probe_http(
    transport: &dyn HttpTransport,
    cfg: &CheckerConfig,
    url: &str,
    opts: &ProbeOptions,
) -> ProbeResult {
    let started = Instant::now();
    let total_budget_ms = opts.timeout_ms;

    let mut parsed = match url::Url::parse(url) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => u,
        Ok(u) => {
            return protocol_failure(format!("unsupported scheme {:?}", u.scheme()));
        }
        Err(e) => {
            return protocol_failure(format!("invalid URL: {e}"));
        }
    };

    let mut method = effective_method(opts);
    let range_eligible = method == "GET"
        && !opts
            .validator
            .as_ref()
            .is_some_and(|v| v.is_configured());

    let mut use_range = range_eligible;
    let mut upgraded = false;
    let mut head_retried = false;
    let mut range_dropped = false;

    let exchange = loop {
        let elapsed_ms = started.elapsed().as_millis() as u32;
        let Some(remaining_ms) = total_budget_ms.checked_sub(elapsed_ms).filter(|r| *r > 0) else {
            break Err(TransportError::new(
                TransportErrorKind::Timeout,
                "total probe budget exhausted".to_string(),
            ));
        };

        let request = build_request(cfg, opts, &parsed, &method, use_range, remaining_ms);
        match transport.send(request).await {
            Ok(response) => {
                if use_range && RANGE_REJECT_CODES.contains(&response.status) {
                    use_range = false;
                    range_dropped = true;
                    continue;
                }
                if range_dropped
                    && !head_retried
                    && method == "GET"
                    && METHOD_REJECT_CODES.contains(&response.status)
                {
                    method = "HEAD".to_string();
                    head_retried = true;
                    continue;
                }
                break Ok(response);
            }
            Err(error) => {
                if parsed.scheme() == "http"
                    && !upgraded
                    && error.kind.allows_https_upgrade()
                {
                    // One shot at the TLS port; many plain-HTTP endpoints are
                    // really redirect stubs with only 443 listening.
                    if parsed.set_scheme("https").is_ok() {
                        upgraded = true;
                        continue;
                    }
                }
                break Err(error);
            }
        }
    };

    let response_time_ms = started.elapsed().as_millis() as u32;

    match exchange {
        Ok(response) => finish_response(response, opts, &method, use_range, response_time_ms),
        Err(error) => finish_error(error, response_time_ms),
    }
}

/// Explicit method, else POST when a body is configured, else GET.
fn effective_method(opts: &ProbeOptions) -> String {
    if let Some(method) = &opts.method {
        return method.to_uppercase();
    }
    if opts.body.is_some() {
        return "POST".to_string();
    }
    "GET".to_string()
}

fn build_request(
    cfg: &CheckerConfig,
    opts: &ProbeOptions,
    url: &url::Url,
    method: &str,
    use_range: bool,
    timeout_ms: u32,
) -> TransportRequest {
    let mut headers: Vec<(String, String)> = Vec::with_capacity(opts.headers.len() + 4);
    headers.push(("User-Agent".to_string(), cfg.user_agent.clone()));
    headers.push(("Accept".to_string(), "*/*".to_string()));

    if opts.cache_no_cache {
        headers.push(("Cache-Control".to_string(), "no-cache".to_string()));
        headers.push(("Pragma".to_string(), "no-cache".to_string()));
    }
    if use_range {
        headers.push(("Range".to_string(), "bytes=0-0".to_string()));
    }
    if opts.body.is_some()
        && opts.kind == TargetKind::RestEndpoint
        && !opts.headers.keys().any(|k| k.eq_ignore_ascii_case("content-type"))
    {
        headers.push(("Content-Type".to_string(), "application/json".to_string()));
    }
    for (name, value) in &opts.headers {
        headers.push((name.clone(), value.clone()));
    }

    TransportRequest {
        method: method.to_string(),
        url: url.to_string(),
        headers,
        body: opts.body.as_ref().map(|b| b.clone().into_bytes()),
        timeout_ms,
        body_cap: cfg.body_snippet_max_bytes,
        body_read_timeout_ms: cfg.body_read_timeout_ms,
        read_body: method != "HEAD",
    }
}

fn finish_response(
    response: TransportResponse,
    opts: &ProbeOptions,
    method: &str,
    range_used: bool,
    response_time_ms: u32,
) -> ProbeResult {
    let snippet = if response.body.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&response.body).into_owned())
    };

    let classification = classify_response(
        i32::from(response.status),
        &opts.expected_status_codes,
        opts.validator.as_ref(),
        snippet.as_deref(),
        response_time_ms,
        opts.response_time_limit_ms,
    );

    let redirect_location = if (300..400).contains(&response.status) {
        response.header("location").map(str::to_string)
    } else {
        None
    };

    let edge = edge_hints(&response);

    ProbeResult {
        status: classification.status,
        detailed: classification.detailed,
        status_code: i32::from(response.status),
        response_time_ms,
        timings: Some(response.timings),
        body_snippet: snippet,
        redirect_location,
        error: classification.error,
        metadata: None,
        edge: if edge.is_empty() && edge.headers.is_empty() {
            None
        } else {
            Some(edge)
        },
        ssl_cert: None,
        method_used: Some(method.to_string()),
        range_used,
    }
}

fn finish_error(error: TransportError, response_time_ms: u32) -> ProbeResult {
    let stage = error.kind.stage();
    let (status_code, message) = match error.kind {
        TransportErrorKind::Timeout => (
            STATUS_CODE_TIMEOUT,
            format!(
                "Timed out after {response_time_ms}ms during {} stage",
                stage.label()
            ),
        ),
        _ => (
            STATUS_CODE_CONNECTION_ERROR,
            format!("{} (stage: {})", error.message, stage.label()),
        ),
    };

    ProbeResult {
        status: TargetStatus::Offline,
        detailed: DetailedStatus::Down,
        status_code,
        response_time_ms,
        timings: None,
        body_snippet: None,
        redirect_location: None,
        error: Some(message),
        metadata: None,
        edge: None,
        ssl_cert: None,
        method_used: None,
        range_used: false,
    }
}

fn protocol_failure(message: String) -> ProbeResult {
    ProbeResult {
        status: TargetStatus::Offline,
        detailed: DetailedStatus::Down,
        status_code: STATUS_CODE_CONNECTION_ERROR,
        response_time_ms: 0,
        timings: None,
        body_snippet: None,
        redirect_location: None,
        error: Some(message),
        metadata: None,
        edge: None,
        ssl_cert: None,
        method_used: None,
        range_used: false,
    }
}

/// Relevant CDN-identifying headers, sniffed into a provider guess plus the
/// raw values for the warehouse.
fn edge_hints(response: &TransportResponse) -> EdgeHints {
    const RELEVANT: [&str; 7] = [
        "cf-ray",
        "cf-cache-status",
        "x-served-by",
        "x-cache",
        "x-amz-cf-pop",
        "server",
        "via",
    ];

    let mut headers = HashMap::new();
    for name in RELEVANT {
        if let Some(value) = response.header(name) {
            headers.insert(name.to_string(), value.to_string());
        }
    }

    let server = response.header("server").unwrap_or("").to_lowercase();
    let mut provider = None;
    let mut pop = None;
    let mut ray_id = None;

    if let Some(ray) = response.header("cf-ray") {
        provider = Some("cloudflare".to_string());
        ray_id = Some(ray.to_string());
        // cf-ray is "<id>-<pop>"
        pop = ray.rsplit('-').next().map(str::to_string);
    } else if let Some(served) = response.header("x-served-by") {
        if served.contains("cache-") {
            provider = Some("fastly".to_string());
            // x-served-by trailers look like "cache-fra19128-FRA"
            pop = served.rsplit('-').next().map(str::to_string);
        }
    } else if let Some(cf_pop) = response.header("x-amz-cf-pop") {
        provider = Some("cloudfront".to_string());
        pop = Some(cf_pop.to_string());
    } else if server.contains("cloudflare") {
        provider = Some("cloudflare".to_string());
    } else if server.contains("akamai") {
        provider = Some("akamai".to_string());
    }

    EdgeHints {
        provider,
        pop,
        ray_id,
        headers,
    }
}
