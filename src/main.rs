use anyhow::Context;
use axum::{routing::any, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use request_shield::config::Settings;
use request_shield::core::{
    AuditSink, Clock, CounterStore, FileAuditSink, MemoryCounterStore, RedisCounterStore,
    StaticCountryLookup, SystemClock, TracingAuditSink,
};
use request_shield::middleware::{protect, ShieldState};
use request_shield::utils::init_logging;
use request_shield::{Collaborators, MitigationPipeline};

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    tracing::info!("Starting request shield...");

    let settings = Settings::load().context("failed to load configuration")?;
    let policy = settings.build_policy().context("invalid policy")?;
    tracing::info!("Configuration loaded successfully");

    if let Some(listen) = &settings.metrics.listen {
        let addr: SocketAddr = listen.parse().context("invalid metrics listen address")?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install metrics exporter")?;
        tracing::info!(%addr, "Metrics exporter listening");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let store: Arc<dyn CounterStore> = match &settings.redis.url {
        Some(url) => {
            let store = RedisCounterStore::connect(url, settings.rate_limit.key_prefix.clone())
                .await
                .context("failed to connect to Redis")?;
            tracing::info!("Using Redis counter store");
            Arc::new(store)
        }
        None => {
            tracing::info!("Using in-process counter store");
            Arc::new(MemoryCounterStore::new())
        }
    };

    let lookup = StaticCountryLookup::from_pairs(&settings.geo.networks)
        .context("invalid geo network table")?;
    let audit: Arc<dyn AuditSink> = match &settings.audit.log_path {
        Some(path) => Arc::new(FileAuditSink::new(path)),
        None => Arc::new(TracingAuditSink),
    };

    let pipeline = Arc::new(MitigationPipeline::new(
        &policy,
        Collaborators {
            store,
            lookup: Arc::new(lookup),
            audit,
            clock,
        },
    )?);
    spawn_sweeper(Arc::clone(&pipeline));

    let state = ShieldState::new(pipeline, settings.server.max_body_bytes);
    let app = protect(Router::new().fallback(any(|| async { "OK" })), state)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "Request shield listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Request shield stopped");
    Ok(())
}

/// Periodically drop limiter state that no longer affects decisions.
fn spawn_sweeper(pipeline: Arc<MitigationPipeline>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            match pipeline.rate_limiter().purge().await {
                Ok(purged) => tracing::debug!(purged, "Swept stale rate limit state"),
                Err(e) => tracing::warn!(error = %e, "Rate limit sweep failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
