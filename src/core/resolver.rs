//! Target-metadata resolver: DNS plus best-effort GeoIP.
//!
//! Resolution is two-stage: `lookup_host` for the address set, then the
//! injected [`GeoLookup`] for the primary address. Geo results are cached
//! per IP with a TTL; lookups run under a bounded, FIFO-fair concurrency
//! gate so a burst of probes cannot stampede the geo backend.
//!
//! Every failure is soft. A dead geo backend degrades the metadata, never
//! the probe.

use crate::core::ports::{GeoInfo, GeoLookup};
use crate::core::types::{ResolveError, TargetMetadata};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::lookup_host;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

struct CachedGeo {
    info: GeoInfo,
    fetched_at: Instant,
}

/// Resolver configuration, lifted from the checker config.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub geo_cache_ttl: Duration,
    /// In-flight lookup cap; additional callers wait FIFO.
    pub max_in_flight: usize,
    /// Total budget for one resolution (DNS + geo).
    pub timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            geo_cache_ttl: Duration::from_secs(24 * 60 * 60),
            max_in_flight: 20,
            timeout: Duration::from_secs(10),
        }
    }
}

/// DNS + geo resolver with a per-IP TTL cache.
pub struct MetadataResolver {
    geo: Arc<dyn GeoLookup>,
    cache: Mutex<HashMap<IpAddr, CachedGeo>>,
    // tokio semaphores queue waiters fairly, which gives the FIFO gate.
    gate: Semaphore,
    config: ResolverConfig,
}

impl MetadataResolver {
    pub fn new(geo: Arc<dyn GeoLookup>, config: ResolverConfig) -> Self {
        Self {
            geo,
            cache: Mutex::new(HashMap::new()),
            gate: Semaphore::new(config.max_in_flight.max(1)),
            config,
        }
    }

    /// Resolve metadata for a probe URL. DNS failure is an error; a geo
    /// failure yields metadata with only the DNS-derived fields set.
    pub async fn resolve(&self, raw_url: &str) -> Result<TargetMetadata, ResolveError> {
        let parsed =
            url::Url::parse(raw_url).map_err(|e| ResolveError::InvalidUrl(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ResolveError::InvalidUrl(format!("no host in {raw_url:?}")))?
            .to_string();

        tokio::time::timeout(self.config.timeout, self.resolve_host(&host))
            .await
            .map_err(|_| ResolveError::Timeout)?
    }

    async fn resolve_host(&self, host: &str) -> Result<TargetMetadata, ResolveError> {
        // Acquire before any network work so DNS traffic is bounded too.
        // The semaphore is never closed, so acquisition cannot fail while
        // the resolver is alive.
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| ResolveError::Timeout)?;

        let addrs: Vec<IpAddr> = lookup_host((host, 0u16))
            .await
            .map_err(|e| ResolveError::Dns(e.to_string()))?
            .map(|sa| sa.ip())
            .collect();

        let primary = addrs
            .first()
            .copied()
            .ok_or_else(|| ResolveError::Dns(format!("no addresses for {host}")))?;

        let mut metadata = TargetMetadata {
            hostname: Some(host.to_string()),
            primary_ip: Some(primary.to_string()),
            ips: addrs.iter().map(|ip| ip.to_string()).collect(),
            ip_family: Some(if primary.is_ipv4() { "v4" } else { "v6" }.to_string()),
            ..Default::default()
        };

        match self.geo_for(primary).await {
            Ok(info) => {
                metadata.country = info.country;
                metadata.region_name = info.region_name;
                metadata.city = info.city;
                metadata.lat = info.lat;
                metadata.lon = info.lon;
                metadata.asn = info.asn;
                metadata.org = info.org;
                metadata.isp = info.isp;
            }
            Err(e) => {
                debug!(%host, %primary, error = %e, "geo lookup failed, keeping DNS-only metadata");
            }
        }

        Ok(metadata)
    }

    /// Geo data for one address, served from the TTL cache when fresh.
    async fn geo_for(&self, ip: IpAddr) -> Result<GeoInfo, ResolveError> {
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&ip) {
                if entry.fetched_at.elapsed() < self.config.geo_cache_ttl {
                    return Ok(entry.info.clone());
                }
            }
        }

        let info = self.geo.lookup(ip).await?;

        let mut cache = self.cache.lock().await;
        cache.insert(
            ip,
            CachedGeo {
                info: info.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(info)
    }

    /// Number of cached geo entries (fresh or stale).
    pub async fn cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}
