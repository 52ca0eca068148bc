//! Shared fakes and builders for the integration tests.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;

use watchgrid::adapters::{MemoryTargetStore, MemoryWarehouse};
use watchgrid::config::CheckerConfig;
use watchgrid::core::probe::transport::{
    HttpTransport, TransportError, TransportRequest, TransportResponse,
};
use watchgrid::core::{
    AlertContext, AlertGate, AlertOutcome, AlertPort, AlertSettings, Clock, DetailedStatus,
    GeoInfo, GeoLookup, MetadataResolver, MutationBatcher, NoopCertFetcher, ProbeEngine,
    ResolveError, ResolverConfig, Scheduler, ShutdownSignal, SslCertSnapshot, StageTimings,
    SubscriptionLookup, Target, TargetStatus, TargetStore, TelemetryBuffer, TelemetryRow,
    TransitionCounters, Warehouse,
};

/// Clock with a controllable epoch; monotonic time stays real.
pub struct ManualClock {
    epoch_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(epoch_ms: i64) -> Self {
        Self {
            epoch_ms: AtomicI64::new(epoch_ms),
        }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.epoch_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn epoch_ms(&self) -> i64 {
        self.epoch_ms.load(Ordering::SeqCst)
    }
}

/// HTTP transport that replays a scripted queue of responses and records
/// every request it saw. Respects the request's body cap, like the real
/// transport.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, response: Result<TransportResponse, TransportError>) {
        self.script.lock().await.push_back(response);
    }

    pub async fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let cap = request.body_cap;
        self.requests.lock().await.push(request);
        let mut response = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(http_response(200, &[], b"")));
        if let Ok(resp) = &mut response {
            if resp.body.len() > cap {
                resp.body.truncate(cap);
                resp.body_truncated = true;
            }
        }
        response
    }
}

/// Build a scripted response.
pub fn http_response(status: u16, headers: &[(&str, &str)], body: &[u8]) -> TransportResponse {
    TransportResponse {
        status,
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        body: body.to_vec(),
        body_truncated: false,
        timings: StageTimings {
            dns_ms: Some(2),
            connect_ms: Some(5),
            tls_ms: None,
            ttfb_ms: Some(20),
            total_ms: 27,
        },
    }
}

#[derive(Debug, Clone)]
pub struct RecordedAlert {
    pub target_id: String,
    pub previous: TargetStatus,
    pub current: TargetStatus,
    pub pending_retry: bool,
}

/// Alert port that records every call and replays scripted outcomes
/// (delivered once the script runs dry).
#[derive(Default)]
pub struct RecordingAlertPort {
    script: Mutex<VecDeque<AlertOutcome>>,
    calls: Mutex<Vec<RecordedAlert>>,
    ssl_calls: Mutex<Vec<String>>,
}

impl RecordingAlertPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_outcome(&self, outcome: AlertOutcome) {
        self.script.lock().await.push_back(outcome);
    }

    pub async fn calls(&self) -> Vec<RecordedAlert> {
        self.calls.lock().await.clone()
    }

    pub async fn ssl_calls(&self) -> Vec<String> {
        self.ssl_calls.lock().await.clone()
    }
}

#[async_trait]
impl AlertPort for RecordingAlertPort {
    async fn trigger_alert(
        &self,
        target: &Target,
        previous: TargetStatus,
        current: TargetStatus,
        _counters: TransitionCounters,
        _settings: &AlertSettings,
        context: &AlertContext,
    ) -> AlertOutcome {
        self.calls.lock().await.push(RecordedAlert {
            target_id: target.id.clone(),
            previous,
            current,
            pending_retry: context.pending_retry,
        });
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(AlertOutcome::delivered)
    }

    async fn trigger_ssl_alert(
        &self,
        target: &Target,
        _cert: &SslCertSnapshot,
        _context: &AlertContext,
    ) -> AlertOutcome {
        self.ssl_calls.lock().await.push(target.id.clone());
        AlertOutcome::delivered()
    }
}

/// Geo lookup returning a fixed answer.
pub struct StaticGeoLookup(pub GeoInfo);

#[async_trait]
impl GeoLookup for StaticGeoLookup {
    async fn lookup(&self, _ip: IpAddr) -> Result<GeoInfo, ResolveError> {
        Ok(self.0.clone())
    }
}

/// Subscription lookup with one settings bundle for everyone.
pub struct FixedSubscriptions(pub AlertSettings);

#[async_trait]
impl SubscriptionLookup for FixedSubscriptions {
    async fn alert_settings(&self, _user_id: &str, _tier_hint: Option<&str>) -> AlertSettings {
        self.0.clone()
    }
}

pub fn settings_with_email() -> AlertSettings {
    AlertSettings {
        email: Some("ops@example.com".into()),
        ..AlertSettings::default()
    }
}

/// A minimal HTTP target due immediately.
pub fn target(id: &str, url: &str) -> Target {
    Target {
        id: id.to_string(),
        user_id: "user-1".to_string(),
        url: url.to_string(),
        name: id.to_string(),
        interval_minutes: 5,
        status: TargetStatus::Online,
        next_check_at: 0,
        ..Default::default()
    }
}

pub fn telemetry_row(id: &str) -> TelemetryRow {
    TelemetryRow {
        id: id.to_string(),
        target_id: "t1".into(),
        user_id: "user-1".into(),
        timestamp_ms: 0,
        status: TargetStatus::Online,
        detailed: DetailedStatus::Up,
        status_code: 200,
        response_time_ms: 10,
        error: None,
        timings: None,
        metadata: None,
        edge: None,
    }
}

/// Probe engine wired to a scripted transport (no geo, no certs).
pub fn engine_with(transport: Arc<ScriptedTransport>, cfg: Arc<CheckerConfig>) -> ProbeEngine {
    let resolver = Arc::new(MetadataResolver::new(
        Arc::new(StaticGeoLookup(GeoInfo::default())),
        ResolverConfig::default(),
    ));
    ProbeEngine::new(
        Box::new(SharedTransport(transport)),
        resolver,
        Box::new(NoopCertFetcher),
        cfg,
    )
}

/// Box-friendly wrapper so one scripted transport can be shared between
/// the engine (which owns its transport) and test assertions.
pub struct SharedTransport(pub Arc<ScriptedTransport>);

#[async_trait]
impl HttpTransport for SharedTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.0.send(request).await
    }
}

/// Everything a scheduler test needs, wired to fakes.
pub struct TestRig {
    pub scheduler: Scheduler,
    pub store: Arc<MemoryTargetStore>,
    pub warehouse: Arc<MemoryWarehouse>,
    pub transport: Arc<ScriptedTransport>,
    pub alerts: Arc<RecordingAlertPort>,
    pub telemetry: Arc<TelemetryBuffer>,
    pub mutations: Arc<MutationBatcher>,
    pub clock: Arc<ManualClock>,
    pub shutdown: Arc<ShutdownSignal>,
    pub cfg: Arc<CheckerConfig>,
}

/// Rig with default config and a geo lookup that knows nothing.
pub fn rig(epoch_ms: i64) -> TestRig {
    rig_with(epoch_ms, CheckerConfig::default(), GeoInfo::default())
}

pub fn rig_with(epoch_ms: i64, cfg: CheckerConfig, geo: GeoInfo) -> TestRig {
    let cfg = Arc::new(cfg);
    let clock = Arc::new(ManualClock::new(epoch_ms));
    let store = Arc::new(MemoryTargetStore::new());
    let warehouse = Arc::new(MemoryWarehouse::new());
    let transport = Arc::new(ScriptedTransport::new());
    let alerts_port = Arc::new(RecordingAlertPort::new());
    let shutdown = Arc::new(ShutdownSignal::new());

    let resolver = Arc::new(MetadataResolver::new(
        Arc::new(StaticGeoLookup(geo)),
        ResolverConfig::default(),
    ));
    let engine = Arc::new(ProbeEngine::new(
        Box::new(SharedTransport(Arc::clone(&transport))),
        resolver,
        Box::new(NoopCertFetcher),
        Arc::clone(&cfg),
    ));

    let telemetry = Arc::new(TelemetryBuffer::new(
        Arc::clone(&warehouse) as Arc<dyn Warehouse>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        cfg.telemetry.clone(),
        "probe_telemetry",
    ));
    let mutations = Arc::new(MutationBatcher::new(
        Arc::clone(&store) as Arc<dyn TargetStore>,
        cfg.mutation_flush_interval_ms,
        cfg.mutation_drain_retries,
    ));
    let alerts = Arc::new(AlertGate::new(
        Arc::clone(&alerts_port) as Arc<dyn AlertPort>
    ));

    let scheduler = Scheduler::new(
        Arc::clone(&store) as Arc<dyn TargetStore>,
        engine,
        Arc::clone(&telemetry),
        Arc::clone(&mutations),
        alerts,
        Arc::new(FixedSubscriptions(settings_with_email())),
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::clone(&cfg),
        Arc::clone(&shutdown),
    );

    TestRig {
        scheduler,
        store,
        warehouse,
        transport,
        alerts: alerts_port,
        telemetry,
        mutations,
        clock,
        shutdown,
        cfg,
    }
}
