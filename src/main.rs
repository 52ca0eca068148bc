use std::sync::Arc;
use std::time::Duration;

use watchgrid::adapters::{
    JsonlWarehouse, LogAlertPort, MemoryTargetStore, MemoryWarehouse, NoopGeoLookup,
    StaticSubscriptionLookup,
};
use watchgrid::cli::Cli;
use watchgrid::config::{CheckerConfig, Region};
use watchgrid::core::{
    AlertGate, IsahcTransport, MetadataResolver, MutationBatcher, NoopCertFetcher, ProbeEngine,
    ResolverConfig, Scheduler, ShutdownSignal, SystemClock, Target, TargetStore, TelemetryBuffer,
    Warehouse,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse_args();
    let cfg = Arc::new(CheckerConfig::from_env());

    let regions = parse_regions(&cli.regions)?;

    // Seed the in-memory store from the targets file.
    let store = Arc::new(MemoryTargetStore::new());
    let seed = tokio::fs::read_to_string(&cli.targets).await?;
    let targets: Vec<Target> = serde_json::from_str(&seed)?;
    let seeded = targets.len();
    for target in targets {
        store.insert_target(target).await;
    }
    info!(targets = seeded, "seeded target store");

    let warehouse: Arc<dyn Warehouse> = match &cli.telemetry_out {
        Some(path) => {
            info!(path = %path.display(), "streaming telemetry to JSONL file");
            Arc::new(JsonlWarehouse::new(path))
        }
        None => Arc::new(MemoryWarehouse::new()),
    };

    let clock = Arc::new(SystemClock);
    let shutdown = Arc::new(ShutdownSignal::new());

    let resolver = Arc::new(MetadataResolver::new(
        Arc::new(NoopGeoLookup),
        ResolverConfig {
            geo_cache_ttl: Duration::from_millis(cfg.geo_cache_ttl_ms.max(0) as u64),
            max_in_flight: cfg.resolver_max_in_flight,
            timeout: Duration::from_millis(cfg.resolver_timeout_ms),
        },
    ));

    let transport = IsahcTransport::new().map_err(|e| e.message.clone())?;
    let engine = Arc::new(ProbeEngine::new(
        Box::new(transport),
        Arc::clone(&resolver),
        Box::new(NoopCertFetcher),
        Arc::clone(&cfg),
    ));

    let telemetry = Arc::new(TelemetryBuffer::new(
        Arc::clone(&warehouse),
        clock.clone(),
        cfg.telemetry.clone(),
        "probe_telemetry",
    ));
    let mutations = Arc::new(MutationBatcher::new(
        store.clone() as Arc<dyn TargetStore>,
        cfg.mutation_flush_interval_ms,
        cfg.mutation_drain_retries,
    ));
    let alerts = Arc::new(AlertGate::new(Arc::new(LogAlertPort)));

    let telemetry_task = tokio::spawn(Arc::clone(&telemetry).run(Arc::clone(&shutdown)));
    let mutations_task = tokio::spawn(Arc::clone(&mutations).run(Arc::clone(&shutdown)));

    // SIGINT/SIGTERM flip the shutdown latch; the scheduler stops starting
    // new work and the sinks are drained below.
    spawn_signal_listener(Arc::clone(&shutdown));

    let scheduler = Scheduler::new(
        store.clone() as Arc<dyn TargetStore>,
        engine,
        Arc::clone(&telemetry),
        Arc::clone(&mutations),
        alerts,
        Arc::new(StaticSubscriptionLookup::default()),
        clock,
        Arc::clone(&cfg),
        Arc::clone(&shutdown),
    );

    loop {
        for region in &regions {
            if shutdown.is_triggered() {
                break;
            }
            match scheduler.run_tick(*region).await {
                Ok(outcome) => {
                    info!(
                        region = %outcome.region,
                        probed = outcome.probed,
                        transitions = outcome.transitions,
                        deferred = outcome.deferred,
                        lock = ?outcome.lock,
                        "tick complete"
                    );
                }
                Err(e) => error!(region = %region, error = %e, "tick failed"),
            }
        }

        if cli.once || shutdown.is_triggered() {
            break;
        }
        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = tokio::time::sleep(Duration::from_secs(cli.interval_secs)) => {}
        }
    }

    // Orderly drain: stop the background flush tasks, then flush what is
    // left until empty or the retry budgets run out.
    shutdown.trigger();
    let _ = telemetry_task.await;
    let _ = mutations_task.await;

    let telemetry_left = telemetry.drain().await;
    let mutations_left = mutations.drain().await;
    if telemetry_left > 0 || mutations_left > 0 {
        warn!(telemetry_left, mutations_left, "drain finished with leftovers");
    }
    info!("shutdown complete");
    Ok(())
}

fn parse_regions(codes: &[String]) -> Result<Vec<Region>, String> {
    if codes.is_empty() {
        return Ok(vec![Region::canonical()]);
    }
    codes
        .iter()
        .map(|c| c.parse::<Region>().map_err(|e| e.to_string()))
        .collect()
}

fn spawn_signal_listener(shutdown: Arc<ShutdownSignal>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    shutdown.trigger();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        shutdown.trigger();
    });
}
