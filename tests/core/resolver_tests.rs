//! Resolver tests: DNS-derived metadata, geo cache, soft failures.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use watchgrid::core::{GeoInfo, GeoLookup, MetadataResolver, ResolveError, ResolverConfig};

/// Geo lookup that counts invocations.
struct CountingGeo {
    calls: AtomicUsize,
    result: GeoInfo,
}

impl CountingGeo {
    fn new(result: GeoInfo) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            result,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeoLookup for CountingGeo {
    async fn lookup(&self, _ip: IpAddr) -> Result<GeoInfo, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }
}

/// Geo lookup that always fails.
struct BrokenGeo;

#[async_trait]
impl GeoLookup for BrokenGeo {
    async fn lookup(&self, _ip: IpAddr) -> Result<GeoInfo, ResolveError> {
        Err(ResolveError::Geo("backend offline".into()))
    }
}

#[tokio::test]
async fn resolves_ip_literal_without_geo_backend_damage() {
    let resolver = MetadataResolver::new(Arc::new(BrokenGeo), ResolverConfig::default());

    let metadata = resolver.resolve("https://127.0.0.1/health").await.unwrap();
    assert_eq!(metadata.hostname.as_deref(), Some("127.0.0.1"));
    assert_eq!(metadata.primary_ip.as_deref(), Some("127.0.0.1"));
    assert_eq!(metadata.ip_family.as_deref(), Some("v4"));
    assert_eq!(metadata.ips, vec!["127.0.0.1"]);
    // Geo failure is soft: geo fields stay empty.
    assert_eq!(metadata.country, None);
}

#[tokio::test]
async fn geo_results_are_cached_per_ip() {
    let geo = CountingGeo::new(GeoInfo {
        country: Some("DE".into()),
        ..Default::default()
    });
    let resolver = MetadataResolver::new(
        Arc::clone(&geo) as Arc<dyn GeoLookup>,
        ResolverConfig::default(),
    );

    let first = resolver.resolve("https://127.0.0.1/").await.unwrap();
    let second = resolver.resolve("https://127.0.0.1/other").await.unwrap();
    assert_eq!(first.country.as_deref(), Some("DE"));
    assert_eq!(second.country.as_deref(), Some("DE"));
    assert_eq!(geo.calls(), 1);
    assert_eq!(resolver.cache_len().await, 1);
}

#[tokio::test]
async fn expired_cache_entries_are_refreshed() {
    let geo = CountingGeo::new(GeoInfo::default());
    let resolver = MetadataResolver::new(
        Arc::clone(&geo) as Arc<dyn GeoLookup>,
        ResolverConfig {
            geo_cache_ttl: Duration::ZERO,
            ..ResolverConfig::default()
        },
    );

    resolver.resolve("https://127.0.0.1/").await.unwrap();
    resolver.resolve("https://127.0.0.1/").await.unwrap();
    assert_eq!(geo.calls(), 2);
}

#[tokio::test]
async fn invalid_urls_are_rejected() {
    let resolver = MetadataResolver::new(Arc::new(BrokenGeo), ResolverConfig::default());
    assert!(matches!(
        resolver.resolve("not a url").await,
        Err(ResolveError::InvalidUrl(_))
    ));
}
