//! Metrics daemon: sampling, storage, aggregation, and the query API
//! for the cluster dashboard.

use anyhow::Result;
use metrics_core::aggregate::{Aggregator, BucketCache};
use metrics_core::health::components;
use metrics_core::ingest::SampleIngest;
use metrics_core::query::QueryService;
use metrics_core::registry::EntityRegistry;
use metrics_core::scheduler::{CompactionLoop, SamplingLoop};
use metrics_core::store::MetricStore;
use metrics_core::{CoreMetrics, HealthRegistry, StructuredLogger};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod sampler;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting metricsd");

    let config = config::DaemonConfig::load()?;
    let core = config.core.clone();

    // Store, with the previous snapshot restored when one exists
    let store = Arc::new(MetricStore::new());
    if let Some(path) = &core.snapshot_path {
        match store.load_from(path) {
            Ok(loaded) => info!(samples = loaded, path = %path.display(), "Snapshot restored"),
            Err(e) => warn!(
                error = %e,
                path = %path.display(),
                "No snapshot restored, starting empty"
            ),
        }
    }

    let metrics = CoreMetrics::new();
    let logger = StructuredLogger::new();
    logger.log_startup(DAEMON_VERSION, config.api_port);

    let cache = Arc::new(BucketCache::new());
    let aggregator = Arc::new(
        Aggregator::new(store.clone(), cache.clone()).with_metrics(metrics.clone()),
    );
    let ingest = Arc::new(
        SampleIngest::new(store.clone(), cache.clone())
            .with_max_future_skew(core.max_future_skew_secs),
    );
    let registry = Arc::new(EntityRegistry::new());

    let authorizer = Arc::new(api::TokenScope::from_csv(
        config.admin_scope_tokens.as_deref(),
    ));
    let query_service = Arc::new(
        QueryService::new(
            store.clone(),
            aggregator.clone(),
            registry.clone(),
            core.trend_analyzer(),
            authorizer,
        )
        .with_raw_row_cap(core.raw_row_cap)
        .with_timeout(Duration::from_secs(core.query_timeout_secs))
        .with_metrics(metrics.clone()),
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::STORE).await;
    health_registry.register(components::INGEST).await;
    health_registry.register(components::COMPACTOR).await;
    health_registry.register(components::QUERY).await;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Sampling loop, when a collaborator is configured
    if let Some(url) = &config.sampler_url {
        health_registry.register(components::SAMPLER).await;
        let sampling = SamplingLoop::new(
            Arc::new(sampler::HttpSampler::new(url)?),
            registry.clone(),
            ingest.clone(),
            core.scheduler(),
        );
        tokio::spawn(sampling.run(shutdown_tx.subscribe()));
    } else {
        info!("No sampler URL configured, sampling loop disabled");
    }

    // Retention compaction loop; without a rollup path expired raw data
    // is kept, since there would be nowhere durable to summarize it to
    let mut compaction = CompactionLoop::new(store.clone(), aggregator.clone(), core.scheduler())
        .with_metrics(metrics.clone());
    match &config.rollup_path {
        Some(path) => compaction = compaction.with_rollup_path(PathBuf::from(path)),
        None => info!("No rollup path configured, retention deletion disabled"),
    }
    tokio::spawn(compaction.run(shutdown_tx.subscribe()));

    // Housekeeping: publish component counters to Prometheus and flush
    // the snapshot when persistence is configured
    {
        let store = store.clone();
        let ingest = ingest.clone();
        let cache = cache.clone();
        let registry = registry.clone();
        let metrics = metrics.clone();
        let logger = logger.clone();
        let snapshot_path = core.snapshot_path.clone();
        let interval_secs = core.snapshot_interval_secs;
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = ingest.stats();
                        metrics.record_ingest_counters(
                            stats.accepted(),
                            stats.deduplicated(),
                            stats.rejected(),
                        );
                        metrics.record_cache_counters(cache.hits(), cache.misses());
                        metrics.set_samples_stored(store.sample_count() as i64);
                        metrics.set_entities_registered(registry.len() as i64);

                        if let Some(path) = &snapshot_path {
                            match store.snapshot_to(path) {
                                Ok(count) => {
                                    logger.log_snapshot(&path.display().to_string(), count, true);
                                }
                                Err(e) => {
                                    warn!(error = %e, "Snapshot flush failed");
                                    logger.log_snapshot(&path.display().to_string(), 0, false);
                                }
                            }
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    let app_state = Arc::new(api::AppState {
        health_registry: health_registry.clone(),
        metrics,
        logger: logger.clone(),
        query_service,
        registry,
    });

    health_registry.set_ready(true).await;
    tokio::spawn(api::serve(config.api_port, app_state));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    // Stop the loops, then take a final snapshot so no raw data is lost
    let _ = shutdown_tx.send(());
    if let Some(path) = &core.snapshot_path {
        if let Err(e) = store.snapshot_to(path) {
            warn!(error = %e, "Final snapshot failed");
        }
    }
    info!("Shutdown complete");

    Ok(())
}
