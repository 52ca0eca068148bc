//! UDP datagram probe.
//!
//! Sends a zero-byte datagram on a connected socket. Any inbound message
//! before the timeout is proof of life; a silent timeout is *also* treated
//! as online, because most UDP services neither echo nor reject unknown
//! payloads. Only a synchronous socket error (typically an ICMP
//! port-unreachable surfaced on the connected socket) marks the target
//! offline.

use crate::core::types::{
    DetailedStatus, ProbeResult, TargetStatus, STATUS_CODE_CONNECTION_ERROR,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, UdpSocket};

pub(super) async fn probe_udp(url: &str, timeout_ms: u32) -> ProbeResult {
    let started = Instant::now();

    let (host, port) = match super::parse_host_port(url) {
        Ok(pair) => pair,
        Err(message) => return failure(0, message),
    };

    let timeout = Duration::from_millis(u64::from(timeout_ms));
    let outcome = tokio::time::timeout(timeout, exchange(&host, port)).await;
    let elapsed = started.elapsed().as_millis() as u32;

    match outcome {
        Ok(Ok(())) | Err(_) => online(elapsed),
        Ok(Err(message)) => failure(elapsed, message),
    }
}

/// Resolve, bind a socket of the matching family, connect, send an empty
/// datagram and wait for any reply. `Ok` means a message arrived; the
/// caller treats an expired wait as online too.
async fn exchange(host: &str, port: u16) -> Result<(), String> {
    let addr = lookup_host((host, port))
        .await
        .map_err(|e| format!("DNS lookup for {host} failed: {e}"))?
        .next()
        .ok_or_else(|| format!("DNS lookup for {host} returned no addresses"))?;

    let bind_addr: SocketAddr = match addr {
        SocketAddr::V4(_) => "0.0.0.0:0".parse().map_err(|e| format!("bind address: {e}"))?,
        SocketAddr::V6(_) => "[::]:0".parse().map_err(|e| format!("bind address: {e}"))?,
    };

    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| format!("UDP bind failed: {e}"))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| format!("UDP connect to {addr} failed: {e}"))?;
    socket
        .send(&[])
        .await
        .map_err(|e| format!("UDP send to {addr} failed: {e}"))?;

    let mut buf = [0u8; 1500];
    socket
        .recv(&mut buf)
        .await
        .map_err(|e| format!("UDP socket error from {addr}: {e}"))?;
    Ok(())
}

fn online(response_time_ms: u32) -> ProbeResult {
    ProbeResult {
        status: TargetStatus::Online,
        detailed: DetailedStatus::Up,
        status_code: 0,
        response_time_ms,
        timings: None,
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

fn failure(response_time_ms: u32, message: String) -> ProbeResult {
    ProbeResult {
        status: TargetStatus::Offline,
        detailed: DetailedStatus::Down,
        status_code: STATUS_CODE_CONNECTION_ERROR,
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
