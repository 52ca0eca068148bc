//! Raw TCP connect probe.
//!
//! A `tcp://host:port` target is online when a TCP connection can be
//! established within the light-check timeout. Nothing is written or read
//! on the socket.

use crate::core::types::{
    DetailedStatus, ProbeResult, StageTimings, TargetStatus, STATUS_CODE_CONNECTION_ERROR,
    STATUS_CODE_TIMEOUT,
};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

pub(super) async fn probe_tcp(url: &str, timeout_ms: u32) -> ProbeResult {
    let started = Instant::now();

    let (host, port) = match super::parse_host_port(url) {
        Ok(pair) => pair,
        Err(message) => return failure(STATUS_CODE_CONNECTION_ERROR, 0, message),
    };

    let timeout = Duration::from_millis(u64::from(timeout_ms));
    match tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(_stream)) => {
            let connect_ms = started.elapsed().as_millis() as u32;
            ProbeResult {
                status: TargetStatus::Online,
                detailed: DetailedStatus::Up,
                status_code: 0,
                response_time_ms: connect_ms,
                timings: Some(StageTimings {
                    dns_ms: None,
                    connect_ms: Some(connect_ms),
                    tls_ms: None,
                    ttfb_ms: None,
                    total_ms: connect_ms,
                }),
                body_snippet: None,
                redirect_location: None,
                error: None,
                metadata: None,
                edge: None,
                ssl_cert: None,
                method_used: None,
                range_used: false,
            }
        }
        Ok(Err(e)) => {
            let elapsed = started.elapsed().as_millis() as u32;
            failure(
                STATUS_CODE_CONNECTION_ERROR,
                elapsed,
                format!("TCP connect to {host}:{port} failed: {e}"),
            )
        }
        Err(_) => {
            let elapsed = started.elapsed().as_millis() as u32;
            failure(
                STATUS_CODE_TIMEOUT,
                elapsed,
                format!("TCP connect to {host}:{port} timed out after {timeout_ms}ms"),
            )
        }
    }
}

fn failure(status_code: i32, response_time_ms: u32, message: String) -> ProbeResult {
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
